//! One-way framed byte channels between the roles
//!
//! Each channel is an OS pipe.  Both ends are close-on-exec so that
//! a spawned role only inherits the ends handed to it explicitly.
//! The read end is non-blocking: [`ReadEnd::try_read`] returns
//! `Ok(None)` instead of waiting when nothing has arrived.  The write
//! end blocks when the pipe is full.

use crate::error::PipelineError;
use crate::frame::{FrameDecoder, FrameSpec, Message};
use libc::{c_int, c_void, size_t};
use std::io::{Error, Result};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Size of the scratch buffer the roles read into
pub const READ_CHUNK: usize = 4096;

/// Receiving end of a channel
pub struct ReadEnd {
    fd: OwnedFd,
    decoder: FrameDecoder,
}

/// Sending end of a channel
pub struct WriteEnd {
    fd: OwnedFd,
    spec: FrameSpec,
}

/// What [`ReadEnd::drain`] found once nothing more could be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// No message now; the writer is still there
    Idle,
    /// The writer has gone and every complete frame was delivered
    Closed,
}

/// Create a channel, returning (read end, write end)
pub fn create(spec: FrameSpec) -> Result<(ReadEnd, WriteEnd)> {
    let mut fds = [0 as c_int; 2];
    if 0 > unsafe { libc::pipe(fds.as_mut_ptr()) } {
        return Err(Error::last_os_error());
    }
    // Owned from here on, so an early return below closes both
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    for fd in &fds {
        set_fd_flag(*fd, libc::FD_CLOEXEC, true)?;
    }
    set_nonblocking(fds[0])?;
    Ok((ReadEnd::new(read, spec), WriteEnd::new(write, spec)))
}

impl ReadEnd {
    fn new(fd: OwnedFd, spec: FrameSpec) -> Self {
        Self {
            fd,
            decoder: FrameDecoder::new(spec),
        }
    }

    /// Adopt an inherited descriptor.  It is switched to non-blocking
    /// mode in case the sender did not.
    ///
    /// # Safety
    ///
    /// `fd` must be an open pipe read end owned by nobody else in this
    /// process.
    pub unsafe fn from_raw_fd(fd: RawFd, spec: FrameSpec) -> Result<Self> {
        check_open(fd)?;
        let owned = OwnedFd::from_raw_fd(fd);
        set_nonblocking(fd)?;
        Ok(Self::new(owned, spec))
    }

    /// Get the next message without blocking.  `buf` is scratch space
    /// for the raw read.  Returns `Ok(None)` when no complete frame
    /// is available right now, and `Err(ChannelClosed)` once the
    /// writer has gone and all complete frames have been returned.
    pub fn try_read(&mut self, buf: &mut [u8]) -> std::result::Result<Option<Message>, PipelineError> {
        loop {
            if let Some(msg) = self.decoder.next_frame()? {
                return Ok(Some(msg));
            }
            let cnt = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len() as size_t,
                )
            };
            if cnt < 0 {
                #[allow(unreachable_patterns)]
                match errno::errno().0 {
                    libc::EWOULDBLOCK | libc::EAGAIN => return Ok(None),
                    libc::EINTR => continue,
                    _ => return Err(Error::last_os_error().into()),
                }
            }
            if cnt == 0 {
                self.decoder.finish()?;
                return Err(PipelineError::ChannelClosed);
            }
            self.decoder.push(&buf[..cnt as usize]);
        }
    }

    /// Hand every message available right now to `f`
    pub fn drain<F>(&mut self, buf: &mut [u8], mut f: F) -> std::result::Result<Drain, PipelineError>
    where
        F: FnMut(Message) -> std::result::Result<(), PipelineError>,
    {
        loop {
            match self.try_read(buf) {
                Ok(Some(msg)) => f(msg)?,
                Ok(None) => return Ok(Drain::Idle),
                Err(PipelineError::ChannelClosed) => return Ok(Drain::Closed),
                Err(e) => return Err(e),
            }
        }
    }
}

impl WriteEnd {
    fn new(fd: OwnedFd, spec: FrameSpec) -> Self {
        Self { fd, spec }
    }

    /// Adopt an inherited descriptor
    ///
    /// # Safety
    ///
    /// `fd` must be an open pipe write end owned by nobody else in
    /// this process.
    pub unsafe fn from_raw_fd(fd: RawFd, spec: FrameSpec) -> Result<Self> {
        check_open(fd)?;
        Ok(Self::new(OwnedFd::from_raw_fd(fd), spec))
    }

    /// Send one message as one frame.  Blocks while the pipe is full.
    pub fn write(&mut self, msg: &Message) -> std::result::Result<(), PipelineError> {
        let frame = self.spec.encode(msg.as_bytes())?;
        write_all(self.fd.as_raw_fd(), &frame)?;
        Ok(())
    }
}

impl AsRawFd for ReadEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsRawFd for WriteEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let cnt = unsafe { libc::write(fd, data.as_ptr() as *const c_void, data.len() as size_t) };
        if cnt < 0 {
            if errno::errno().0 == libc::EINTR {
                continue;
            }
            return Err(Error::last_os_error());
        }
        data = &data[cnt as usize..];
    }
    Ok(())
}

fn check_open(fd: RawFd) -> Result<()> {
    if 0 > unsafe { libc::fcntl(fd, libc::F_GETFD) } {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Set or clear a descriptor flag (`FD_CLOEXEC`)
pub(crate) fn set_fd_flag(fd: RawFd, flag: c_int, on: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    let flags = if on { flags | flag } else { flags & !flag };
    if 0 > unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    if 0 > unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } {
        return Err(Error::last_os_error());
    }
    Ok(())
}
