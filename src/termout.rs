use libc::{c_int, c_void, size_t};
use std::io::{Error, Result, Write};

const STDOUT_FD: c_int = 1;

/// Line break used around transformed lines.  The terminal is in raw
/// mode, so a bare LF would not return the cursor to the left edge.
pub const LINE_BREAK: &[u8] = b"\r\n";

/// Output buffer for the display
///
/// Data is gathered into a local buffer and then written to the sink
/// in a single call.  Both kinds of output are flushed as soon as
/// they're added, so that keystrokes appear as the user types.
pub struct TermOut<W: Write> {
    buf: Vec<u8>,
    sink: W,
}

impl<W: Write> TermOut<W> {
    pub fn new(sink: W) -> Self {
        Self {
            buf: Vec::new(),
            sink,
        }
    }

    /// Show a raw echoed unit, with no line break
    pub fn echo(&mut self, unit: &[u8]) -> Result<()> {
        self.out(unit);
        self.flush_all()
    }

    /// Show a transformed line on a line of its own
    pub fn line(&mut self, text: &[u8]) -> Result<()> {
        self.out(LINE_BREAK);
        self.out(text);
        self.out(LINE_BREAK);
        self.flush_all()
    }

    /// Add a chunk of byte data to the output buffer
    #[inline]
    pub fn out(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Write everything buffered to the sink
    pub fn flush_all(&mut self) -> Result<()> {
        let result = self.sink.write_all(&self.buf).and_then(|_| self.sink.flush());
        self.buf.clear();
        result
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }
}

/// Sink that dumps data straight to the stdout FD, with a blocking
/// call.  This will block the whole thread if the TTY is in XOFF.
pub struct StdoutFd;

impl Write for StdoutFd {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        loop {
            let cnt = unsafe { libc::write(STDOUT_FD, data.as_ptr() as *const c_void, data.len() as size_t) };
            if cnt >= 0 {
                return Ok(cnt as usize);
            }
            let err = Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_has_no_line_break() {
        let mut out = TermOut::new(Vec::new());
        out.echo(b"h").unwrap();
        out.echo(b"i").unwrap();
        assert_eq!(out.sink(), b"hi");
    }

    #[test]
    fn test_line_is_framed_by_breaks() {
        let mut out = TermOut::new(Vec::new());
        out.echo(b"E").unwrap();
        out.line(b"zc").unwrap();
        assert_eq!(out.sink(), b"E\r\nzc\r\n");
    }
}
