//! Handle SIGINT/SIGTERM through UNIX signals forwarded through pipes
//! to MIO.  Read keyboard input from stdin FD with non-blocking
//! calls.  Switch the TTY to raw mode and back with termios.

use crate::role::ControlSignal;
use libc::c_int;
use signal_hook::SigId;
use stakker::{fwd, fwd_do, Fwd};
use stakker_mio::mio::Interest;
use stakker_mio::{FdSource, MioPoll, MioSource};
use std::io::{Error, ErrorKind, Result};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

const STDIN_FD: c_int = 0;

/// Priority passed to MIO for every source
pub(crate) const PRI: u32 = 16;

/// Control signals arriving as readable events on self-pipes, one
/// pipe per signal so the two can be told apart
pub struct ControlGlue {
    _pipes: Vec<(UnixStream, MioSource<FdSource>)>,
    sigids: Vec<SigId>,
}

impl ControlGlue {
    /// Register handlers for both control signals, then unblock them.
    /// A signal sent while it was blocked (during process start-up)
    /// is delivered at this point.
    pub fn new(poll: &MioPoll, notify: Fwd<ControlSignal>) -> Result<Self> {
        let mut this = Self {
            _pipes: Vec::new(),
            sigids: Vec::new(),
        };
        for &sig in &ControlSignal::ALL {
            let (read, write) = UnixStream::pair()?;
            let sigid = signal_hook::pipe::register(sig.signo(), write)?;
            this.sigids.push(sigid);
            read.set_nonblocking(true)?;
            let fd = read.as_raw_fd();
            let notify = notify.clone();
            let fwd = fwd_do!(move |_| {
                // Read all bytes from the notification pipe, to make sure
                // we get a new Ready notification for the next byte sent
                let mut buf = [0u8; 32];
                while 0 < unsafe { libc::read(fd, &mut buf[0] as *mut u8 as *mut _, buf.len()) } {}
                fwd!([notify], sig);
            });
            let src = poll.add(FdSource::new(fd), Interest::READABLE, PRI, fwd)?;
            this._pipes.push((read, src));
        }
        set_control_mask(libc::SIG_UNBLOCK)?;
        Ok(this)
    }
}

impl Drop for ControlGlue {
    fn drop(&mut self) {
        // This call cleans up the UnixStream write ends
        for sigid in self.sigids.drain(..) {
            signal_hook::unregister(sigid);
        }
    }
}

/// Block both control signals.  Runs in a freshly forked child
/// before exec, so only async-signal-safe calls are made.
pub(crate) fn block_control_signals() -> Result<()> {
    set_control_mask(libc::SIG_BLOCK)
}

fn set_control_mask(how: c_int) -> Result<()> {
    unsafe {
        let mut set = mem::MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        for &sig in &ControlSignal::ALL {
            libc::sigaddset(set.as_mut_ptr(), sig.signo());
        }
        let set = set.assume_init();
        match libc::pthread_sigmask(how, &set, std::ptr::null_mut()) {
            0 => Ok(()),
            e => Err(Error::from_raw_os_error(e)),
        }
    }
}

/// Keyboard input from stdin.  The FD is switched to non-blocking
/// mode for the lifetime of this value and restored on drop, since
/// the flag is shared with whoever else holds the same open file
/// (e.g. the shell).
pub struct Stdin {
    saved_flags: c_int,
}

impl Stdin {
    pub fn new() -> Result<Self> {
        let saved_flags = unsafe { libc::fcntl(STDIN_FD, libc::F_GETFL) };
        if saved_flags < 0 {
            return Err(Error::last_os_error());
        }
        if 0 > unsafe { libc::fcntl(STDIN_FD, libc::F_SETFL, saved_flags | libc::O_NONBLOCK) } {
            return Err(Error::last_os_error());
        }
        Ok(Self { saved_flags })
    }

    /// FD to register with MIO for readable notifications
    pub fn fd(&self) -> RawFd {
        STDIN_FD
    }

    /// Read all available stdin data into given Vec.  Returns false
    /// once stdin has reached end-of-file.
    pub fn read_data(&mut self, inbuf: &mut Vec<u8>) -> Result<bool> {
        let mut buf = [0u8; 32];
        loop {
            let cnt = unsafe { libc::read(STDIN_FD, &mut buf[0] as *mut u8 as *mut _, buf.len()) };
            if cnt < 0 {
                #[allow(unreachable_patterns)]
                match errno::errno().0 {
                    libc::EWOULDBLOCK | libc::EAGAIN => return Ok(true),
                    libc::EINTR => continue,
                    _ => return Err(Error::last_os_error()),
                }
            }
            if cnt == 0 {
                return Ok(false);
            }
            inbuf.extend_from_slice(&buf[..cnt as usize]);
        }
    }
}

impl Drop for Stdin {
    fn drop(&mut self) {
        unsafe { libc::fcntl(STDIN_FD, libc::F_SETFL, self.saved_flags) };
    }
}

/// Check whether stdin is a terminal at all
pub fn stdin_is_tty() -> bool {
    0 != unsafe { libc::isatty(STDIN_FD) }
}

// Set terminal into raw mode with no local echo, returning the
// previous state so that it can be restored
pub(crate) fn termios_set_raw() -> Result<libc::termios> {
    if !stdin_is_tty() {
        return Err(Error::new(ErrorKind::Other, "Standard input is not a TTY"));
    }

    let mut tbuf = mem::MaybeUninit::uninit();
    if 0 > unsafe { libc::tcgetattr(STDIN_FD, tbuf.as_mut_ptr()) } {
        return Err(Error::new(
            Error::last_os_error().kind(),
            "Unable to get terminal mode",
        ));
    }
    let saved = unsafe { tbuf.assume_init() };
    let mut raw = saved;
    unsafe { libc::cfmakeraw(&mut raw as *mut _) };
    // Carriage returns are dropped; 'E' submits a line instead
    raw.c_iflag |= libc::IGNCR;

    if 0 > unsafe { libc::tcsetattr(STDIN_FD, libc::TCSANOW, &raw as *const libc::termios) } {
        return Err(Error::new(
            Error::last_os_error().kind(),
            "Unable to set terminal raw mode",
        ));
    }
    Ok(saved)
}

// Restore terminal settings
pub(crate) fn termios_restore(saved: &libc::termios) -> Result<()> {
    if 0 > unsafe { libc::tcsetattr(STDIN_FD, libc::TCSANOW, saved as *const libc::termios) } {
        return Err(Error::new(
            Error::last_os_error().kind(),
            "Unable to restore terminal mode",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_round_trip() {
        block_control_signals().unwrap();
        let mut cur = mem::MaybeUninit::<libc::sigset_t>::uninit();
        let cur = unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), cur.as_mut_ptr());
            cur.assume_init()
        };
        assert_eq!(1, unsafe { libc::sigismember(&cur, libc::SIGTERM) });
        set_control_mask(libc::SIG_UNBLOCK).unwrap();
    }
}
