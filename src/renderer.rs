//! Renderer role: the only writer to the display
//!
//! Two sources arrive independently: raw echo units from Capture and
//! transformed lines from Transformer.  Readiness on either channel
//! triggers one poll pass over both, with non-blocking reads, so a
//! quiet source never holds up the other and nothing is spent while
//! both are idle.

use crate::channel::{Drain, ReadEnd, READ_CHUNK};
use crate::error::PipelineError;
use crate::os_glue::{ControlGlue, PRI};
use crate::role::{ControlSignal, Outcome, ProcessRole};
use crate::runtime;
use crate::spawn::{RendererLinks, Spawned};
use crate::termout::{StdoutFd, TermOut};
use stakker::{actor, call, fwd, fwd_do, ret_shutdown, timer_max, Fwd, MaxTimerKey, CX};
use stakker_mio::mio::Interest;
use stakker_mio::{FdSource, MioPoll, MioSource};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// An inbound channel and whether its writer is still there
pub struct Inbound {
    end: ReadEnd,
    open: bool,
}

impl Inbound {
    pub fn new(end: ReadEnd) -> Self {
        Self { end, open: true }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// Both inbound channels of the Renderer
pub struct Feeds {
    pub echo: Inbound,
    pub line: Inbound,
}

impl Feeds {
    pub fn new(links: RendererLinks) -> Self {
        Self {
            echo: Inbound::new(links.echo),
            line: Inbound::new(links.line),
        }
    }

    /// One poll pass: a non-blocking read of each open channel, echo
    /// first.  Returns true once both channels have closed.
    pub fn poll<W: Write>(&mut self, out: &mut TermOut<W>, scratch: &mut [u8]) -> Result<bool, PipelineError> {
        if self.echo.open
            && self.echo.end.drain(scratch, |unit| Ok(out.echo(unit.as_bytes())?))? == Drain::Closed
        {
            tracing::debug!("echo channel closed");
            self.echo.open = false;
        }
        if self.line.open
            && self.line.end.drain(scratch, |line| Ok(out.line(line.as_bytes())?))? == Drain::Closed
        {
            tracing::debug!("line channel closed");
            self.line.open = false;
        }
        Ok(!self.echo.open && !self.line.open)
    }
}

/// Run the Renderer role in this process
pub fn run(spawned: Spawned<RendererLinks>) -> Result<Outcome, PipelineError> {
    let Spawned { role, links, config } = spawned;
    let grace = config.shutdown_grace();
    let _span = tracing::info_span!("role", kind = %role.kind(), pid = role.pid()).entered();
    runtime::run(move |s, done| actor!(s, Renderer::init(role, links, grace, done), ret_shutdown!(s)))
}

/// Actor that writes echo units and transformed lines to stdout
pub struct Renderer {
    role: ProcessRole,
    feeds: Feeds,
    out: TermOut<StdoutFd>,
    echo_src: Option<MioSource<FdSource>>,
    line_src: Option<MioSource<FdSource>>,
    _controls: ControlGlue,
    scratch: Vec<u8>,
    grace: Duration,
    grace_timer: MaxTimerKey,
    closing: bool,
    finished: bool,
    done: Fwd<Outcome>,
}

impl Renderer {
    pub fn init(
        cx: CX![],
        role: ProcessRole,
        links: RendererLinks,
        grace: Duration,
        done: Fwd<Outcome>,
    ) -> Option<Self> {
        let poll = cx.anymap_get::<MioPoll>();

        let mut sources = Vec::new();
        for fd in [links.echo.as_raw_fd(), links.line.as_raw_fd()] {
            let this = cx.this().clone();
            let fwd = fwd_do!(move |_| call!([this], handle_ready()));
            match poll.add(FdSource::new(fd), Interest::READABLE, PRI, fwd) {
                Ok(src) => sources.push(src),
                Err(e) => return Self::init_failed(cx, &done, e.into()),
            }
        }
        let line_src = sources.pop();
        let echo_src = sources.pop();

        let this = cx.this().clone();
        let notify = fwd_do!(move |sig: ControlSignal| call!([this], handle_control(sig)));
        let controls = match ControlGlue::new(&poll, notify) {
            Ok(v) => v,
            Err(e) => return Self::init_failed(cx, &done, e.into()),
        };

        tracing::info!(parent = role.parent(), "renderer ready");
        let this = Self {
            role,
            feeds: Feeds::new(links),
            out: TermOut::new(StdoutFd),
            echo_src,
            line_src,
            _controls: controls,
            scratch: vec![0; READ_CHUNK],
            grace,
            grace_timer: MaxTimerKey::default(),
            closing: false,
            finished: false,
            done,
        };
        call!([cx], handle_ready());
        Some(this)
    }

    fn init_failed(cx: CX![], done: &Fwd<Outcome>, e: PipelineError) -> Option<Self> {
        tracing::error!("renderer start-up failed: {}", e);
        fwd!([done], Outcome::Failed);
        cx.fail(e);
        None
    }

    fn handle_ready(&mut self, cx: CX![]) {
        if self.finished {
            return;
        }
        match self.feeds.poll(&mut self.out, &mut self.scratch) {
            Ok(all_closed) => {
                // Drop MIO handlers for channels that have ended
                if !self.feeds.echo.is_open() {
                    self.echo_src = None;
                }
                if !self.feeds.line.is_open() {
                    self.line_src = None;
                }
                if all_closed {
                    tracing::info!(closing = self.closing, "all inbound channels closed");
                    self.finish(cx, Outcome::Success);
                }
            }
            Err(e) => {
                tracing::error!("transport failure: {}", e);
                self.finish(cx, Outcome::Failed);
            }
        }
    }

    fn handle_control(&mut self, cx: CX![], sig: ControlSignal) {
        if self.finished {
            return;
        }
        tracing::info!(?sig, "control signal");
        match sig {
            ControlSignal::Interrupt => self.finish(cx, Outcome::Interrupted),
            ControlSignal::Terminate => {
                if !self.closing {
                    self.closing = true;
                    let expiry = cx.now() + self.grace;
                    timer_max!(&mut self.grace_timer, expiry, [cx], grace_expired());
                }
                self.handle_ready(cx);
            }
        }
    }

    // Upstream roles did not close their channels in time
    fn grace_expired(&mut self, cx: CX![]) {
        if !self.finished {
            tracing::warn!("shutdown grace period expired");
            self.finish(cx, Outcome::Success);
        }
    }

    fn finish(&mut self, cx: CX![], outcome: Outcome) {
        self.finished = true;
        self.echo_src = None;
        self.line_src = None;
        tracing::info!(?outcome, role = %self.role.kind(), "stopping");
        fwd!([self.done], outcome);
        cx.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::frame::{FrameSpec, Framing, Message};
    use std::time::Instant;

    fn feeds() -> (Feeds, channel::WriteEnd, channel::WriteEnd) {
        let (echo_rx, echo_tx) = channel::create(FrameSpec::echo(Framing::Fixed, 16)).unwrap();
        let (line_rx, line_tx) = channel::create(FrameSpec::line(Framing::Fixed, 256)).unwrap();
        let feeds = Feeds::new(RendererLinks {
            echo: echo_rx,
            line: line_rx,
        });
        (feeds, echo_tx, line_tx)
    }

    #[test]
    fn test_empty_echo_does_not_block_lines() {
        let (mut feeds, _echo_tx, mut line_tx) = feeds();
        line_tx.write(&Message::new(b"za".to_vec())).unwrap();

        let mut out = TermOut::new(Vec::new());
        let mut scratch = vec![0; READ_CHUNK];
        let start = Instant::now();
        let closed = feeds.poll(&mut out, &mut scratch).unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(!closed);
        assert_eq!(out.sink(), b"\r\nza\r\n");
    }

    #[test]
    fn test_echo_fidelity() {
        let (mut feeds, mut echo_tx, mut line_tx) = feeds();
        for b in b"hello" {
            echo_tx.write(&Message::new(vec![*b])).unwrap();
        }
        line_tx.write(&Message::new(b"hello".to_vec())).unwrap();

        let mut out = TermOut::new(Vec::new());
        let mut scratch = vec![0; READ_CHUNK];
        feeds.poll(&mut out, &mut scratch).unwrap();
        assert_eq!(out.sink(), b"hello\r\nhello\r\n");
    }

    #[test]
    fn test_finishes_only_when_both_closed() {
        let (mut feeds, echo_tx, mut line_tx) = feeds();
        let mut out = TermOut::new(Vec::new());
        let mut scratch = vec![0; READ_CHUNK];

        drop(echo_tx);
        assert!(!feeds.poll(&mut out, &mut scratch).unwrap());
        assert!(!feeds.echo.is_open());

        // The other source keeps being served
        line_tx.write(&Message::new(b"late".to_vec())).unwrap();
        drop(line_tx);
        assert!(feeds.poll(&mut out, &mut scratch).unwrap());
        assert_eq!(out.sink(), b"\r\nlate\r\n");
    }
}
