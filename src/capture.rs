//! Capture role: keyboard input and session control
//!
//! Every input unit is echoed to Renderer straight away.  Ordinary
//! units accumulate in a line buffer which is sent to Transformer on
//! the submit unit.  Capture alone can end the session: the kill unit
//! interrupts all three roles, the terminate unit (or end of input)
//! shuts them down in order.

use crate::config::{Config, Keys};
use crate::error::PipelineError;
use crate::frame::Message;
use crate::os_glue::{self, ControlGlue, Stdin, PRI};
use crate::role::{ControlSignal, Outcome, ProcessRole};
use crate::runtime;
use crate::spawn::{self, CaptureLinks, Children, Launch};
use crate::terminal::RawMode;
use stakker::{actor, call, fwd, fwd_do, ret_shutdown, Fwd, CX};
use stakker_mio::mio::Interest;
use stakker_mio::{FdSource, MioPoll, MioSource};
use std::io::ErrorKind;
use std::mem;
use std::path::Path;

/// Classification of one input unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Kill,
    Submit,
    Terminate,
    Text(u8),
}

impl Unit {
    pub fn classify(keys: &Keys, unit: u8) -> Self {
        match unit {
            u if u == keys.kill => Unit::Kill,
            u if u == keys.submit => Unit::Submit,
            u if u == keys.terminate => Unit::Terminate,
            u => Unit::Text(u),
        }
    }
}

/// What Capture must do after taking in one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Unit added to the line buffer
    Append,
    /// Send this line to Transformer
    Submit(Message),
    /// Line too long for a frame: nothing is sent, buffer kept
    Oversized(usize),
    Kill,
    Terminate,
}

/// Line buffer plus unit classification, free of any I/O
pub struct LineEditor {
    keys: Keys,
    buffer: Vec<u8>,
    max: usize,
}

impl LineEditor {
    pub fn new(keys: Keys, max: usize) -> Self {
        Self {
            keys,
            buffer: Vec::new(),
            max,
        }
    }

    pub fn feed(&mut self, unit: u8) -> Step {
        match Unit::classify(&self.keys, unit) {
            Unit::Kill => Step::Kill,
            Unit::Terminate => Step::Terminate,
            Unit::Submit if self.buffer.len() > self.max => Step::Oversized(self.buffer.len()),
            Unit::Submit => Step::Submit(Message::new(mem::take(&mut self.buffer))),
            Unit::Text(b) => {
                self.buffer.push(b);
                Step::Append
            }
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

/// Coordinator life-cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Submitting,
    Terminating,
    Exited,
}

/// Launch the other two roles and run Capture in this process
pub fn run(config: Config, exe: &Path) -> Result<Outcome, PipelineError> {
    let launch = spawn::launch(exe, &config)?;
    let _span = tracing::info_span!("role", kind = %launch.role.kind(), pid = launch.role.pid()).entered();
    runtime::run(move |s, done| actor!(s, Capture::init(launch, config, done), ret_shutdown!(s)))
}

/// Actor that reads the keyboard and coordinates the session
pub struct Capture {
    role: ProcessRole,
    links: Option<CaptureLinks>,
    children: Children,
    editor: LineEditor,
    phase: Phase,
    peers_signalled: bool,
    config: Config,
    stdin: Option<Stdin>,
    stdin_src: Option<MioSource<FdSource>>,
    raw: Option<RawMode>,
    _controls: ControlGlue,
    inbuf: Vec<u8>,
    done: Fwd<Outcome>,
}

impl Capture {
    pub fn init(cx: CX![], launch: Launch, config: Config, done: Fwd<Outcome>) -> Option<Self> {
        let Launch {
            role,
            links,
            mut children,
        } = launch;
        match Self::setup(cx) {
            Ok((controls, stdin, stdin_src)) => {
                let raw = match RawMode::acquire() {
                    Ok(raw) => Some(raw),
                    Err(e) => {
                        tracing::info!("continuing without raw mode: {}", e);
                        None
                    }
                };
                tracing::info!(peers = role.peers().len(), "capture ready");
                if stdin_src.is_none() {
                    call!([cx], handle_input());
                }
                Some(Self {
                    editor: LineEditor::new(config.keys, config.line_frame_size),
                    role,
                    links: Some(links),
                    children,
                    phase: Phase::Running,
                    peers_signalled: false,
                    config,
                    stdin: Some(stdin),
                    stdin_src,
                    raw,
                    _controls: controls,
                    inbuf: Vec::new(),
                    done,
                })
            }
            Err(e) => {
                tracing::error!("capture start-up failed: {}", e);
                // Children see end-of-stream once our ends are dropped
                drop(links);
                if let Err(e) = role.signal_peers(ControlSignal::Terminate) {
                    tracing::warn!("{}", e);
                }
                children.reap(config.reap_timeout());
                fwd!([done], Outcome::Failed);
                cx.fail(e);
                None
            }
        }
    }

    fn setup(cx: CX![]) -> Result<(ControlGlue, Stdin, Option<MioSource<FdSource>>), PipelineError> {
        let poll = cx.anymap_get::<MioPoll>();

        let this = cx.this().clone();
        let notify = fwd_do!(move |sig: ControlSignal| call!([this], handle_control(sig)));
        let controls = ControlGlue::new(&poll, notify)?;

        let stdin = Stdin::new()?;
        let this = cx.this().clone();
        let fwd = fwd_do!(move |_| call!([this], handle_input()));
        let stdin_src = match poll.add(FdSource::new(stdin.fd()), Interest::READABLE, PRI, fwd) {
            Ok(src) => Some(src),
            // epoll refuses regular files and /dev/null, which never block
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                tracing::debug!("stdin cannot be polled, reading it to the end");
                None
            }
            Err(e) => return Err(e.into()),
        };
        if !os_glue::stdin_is_tty() {
            tracing::debug!("stdin is not a terminal");
        }
        Ok((controls, stdin, stdin_src))
    }

    /// Handle new bytes from stdin
    fn handle_input(&mut self, cx: CX![]) {
        let open = match self.stdin.as_mut() {
            None => return,
            Some(stdin) => match stdin.read_data(&mut self.inbuf) {
                Ok(open) => open,
                Err(e) => {
                    tracing::error!("input failure: {}", e);
                    self.finish(cx, Outcome::Failed);
                    return;
                }
            },
        };

        for unit in mem::take(&mut self.inbuf) {
            if self.phase != Phase::Running {
                break;
            }
            if let Err(e) = self.handle_unit(cx, unit) {
                tracing::error!("transport failure: {}", e);
                self.finish(cx, Outcome::Failed);
                return;
            }
        }

        if !open && self.phase == Phase::Running {
            tracing::info!("end of input");
            self.finish(cx, Outcome::Success);
        }
    }

    fn handle_unit(&mut self, cx: CX![], unit: u8) -> Result<(), PipelineError> {
        let links = self.links.as_mut().ok_or(PipelineError::ChannelClosed)?;
        links.echo.write(&Message::new(vec![unit]))?;

        match self.editor.feed(unit) {
            Step::Append => (),
            Step::Submit(line) => {
                self.phase = Phase::Submitting;
                tracing::debug!(len = line.as_bytes().len(), "submitting line");
                links.line.write(&line)?;
                self.phase = Phase::Running;
            }
            Step::Oversized(len) => {
                tracing::debug!(len, max = self.config.line_frame_size, "line too long, submission dropped");
            }
            Step::Kill => {
                // Ends on receipt of our own Interrupt
                self.phase = Phase::Terminating;
                self.peers_signalled = true;
                if let Err(e) = self.role.signal_peers(ControlSignal::Interrupt) {
                    tracing::warn!("{}", e);
                }
                self.role.signal_self(ControlSignal::Interrupt)?;
            }
            Step::Terminate => self.finish(cx, Outcome::Success),
        }
        Ok(())
    }

    fn handle_control(&mut self, cx: CX![], sig: ControlSignal) {
        tracing::info!(?sig, "control signal");
        match sig {
            ControlSignal::Interrupt => self.finish(cx, Outcome::Interrupted),
            ControlSignal::Terminate => self.finish(cx, Outcome::Success),
        }
    }

    // Every way out of Capture passes through here: input stops, the
    // terminal is restored, our channel ends close, the other roles are
    // signalled (unless already done) and reaped.
    fn finish(&mut self, cx: CX![], outcome: Outcome) {
        if self.phase == Phase::Exited {
            return;
        }
        self.phase = Phase::Terminating;

        self.stdin_src = None;
        self.stdin = None;
        if let Some(mut raw) = self.raw.take() {
            if let Err(e) = raw.release() {
                tracing::warn!("{}", e);
            }
        }
        self.links = None;

        if !self.peers_signalled {
            self.peers_signalled = true;
            let sig = match outcome {
                Outcome::Interrupted => ControlSignal::Interrupt,
                _ => ControlSignal::Terminate,
            };
            if let Err(e) = self.role.signal_peers(sig) {
                tracing::warn!("{}", e);
            }
        }
        self.children.reap(self.config.reap_timeout());

        self.phase = Phase::Exited;
        tracing::info!(?outcome, "stopping");
        fwd!([self.done], outcome);
        cx.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor(max: usize) -> LineEditor {
        LineEditor::new(Keys::default(), max)
    }

    #[test]
    fn test_classify_default_keys() {
        let keys = Keys::default();
        assert_eq!(Unit::classify(&keys, 0x0B), Unit::Kill);
        assert_eq!(Unit::classify(&keys, b'E'), Unit::Submit);
        assert_eq!(Unit::classify(&keys, b'T'), Unit::Terminate);
        assert_eq!(Unit::classify(&keys, b'e'), Unit::Text(b'e'));
        // Line-editing markers are plain text to Capture
        assert_eq!(Unit::classify(&keys, b'X'), Unit::Text(b'X'));
        assert_eq!(Unit::classify(&keys, b'K'), Unit::Text(b'K'));
    }

    #[test]
    fn test_submit_clears_buffer() {
        let mut ed = editor(256);
        for b in b"abXc" {
            assert_eq!(ed.feed(*b), Step::Append);
        }
        assert_eq!(ed.feed(b'E'), Step::Submit(Message::new(b"abXc".to_vec())));
        assert!(ed.buffered().is_empty());
        assert_eq!(ed.feed(b'E'), Step::Submit(Message::default()));
    }

    #[test]
    fn test_control_units_not_buffered() {
        let mut ed = editor(256);
        ed.feed(b'h');
        assert_eq!(ed.feed(0x0B), Step::Kill);
        assert_eq!(ed.feed(b'T'), Step::Terminate);
        assert_eq!(ed.buffered(), b"h");
    }

    #[test]
    fn test_line_at_limit_is_sent() {
        let mut ed = editor(4);
        for b in b"abcd" {
            ed.feed(*b);
        }
        assert_eq!(ed.feed(b'E'), Step::Submit(Message::new(b"abcd".to_vec())));
    }

    #[test]
    fn test_oversized_submission_dropped() {
        let mut ed = editor(4);
        for b in b"abcde" {
            ed.feed(*b);
        }
        assert_eq!(ed.feed(b'E'), Step::Oversized(5));
        // Nothing was sent and the buffer is left as it was
        assert_eq!(ed.buffered(), b"abcde");
    }
}
