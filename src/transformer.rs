//! Transformer role: rewrites submitted lines
//!
//! Each line frame from Capture is run through a fixed rule table
//! and the result is sent to Renderer as one line frame.  Rules see
//! only the line being processed: markers edit the output built so
//! far for that line and nothing earlier.
//!
//! | input       | effect on output     |
//! |-------------|----------------------|
//! | `a`         | append `z`           |
//! | `z`         | append `a`           |
//! | `X`         | remove last byte     |
//! | `K`         | clear output         |
//! | other       | append unchanged     |

use crate::channel::{Drain, READ_CHUNK};
use crate::error::PipelineError;
use crate::frame::Message;
use crate::os_glue::{ControlGlue, PRI};
use crate::role::{ControlSignal, Outcome, ProcessRole};
use crate::runtime;
use crate::spawn::{Spawned, TransformerLinks};
use stakker::{actor, call, fwd, fwd_do, ret_shutdown, Fwd, CX};
use stakker_mio::mio::Interest;
use stakker_mio::{FdSource, MioPoll, MioSource};
use std::os::unix::io::AsRawFd;

/// Backspace marker: drop the last byte of the output so far
pub const BACKSPACE: u8 = b'X';

/// Kill-line marker: drop all of the output so far
pub const KILL_LINE: u8 = b'K';

/// Apply the rule table to one line
pub fn translate(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &ch in input {
        match ch {
            b'a' => out.push(b'z'),
            b'z' => out.push(b'a'),
            BACKSPACE => {
                out.pop();
            }
            KILL_LINE => out.clear(),
            _ => out.push(ch),
        }
    }
    out
}

/// Run the Transformer role in this process
pub fn run(spawned: Spawned<TransformerLinks>) -> Result<Outcome, PipelineError> {
    let Spawned { role, links, .. } = spawned;
    let _span = tracing::info_span!("role", kind = %role.kind(), pid = role.pid()).entered();
    runtime::run(move |s, done| actor!(s, Transformer::init(role, links, done), ret_shutdown!(s)))
}

/// Actor that drains line frames from Capture and forwards their
/// translations to Renderer
pub struct Transformer {
    role: ProcessRole,
    links: TransformerLinks,
    _inbound_src: MioSource<FdSource>,
    _controls: ControlGlue,
    scratch: Vec<u8>,
    done: Fwd<Outcome>,
    finished: bool,
}

impl Transformer {
    pub fn init(cx: CX![], role: ProcessRole, links: TransformerLinks, done: Fwd<Outcome>) -> Option<Self> {
        let poll = cx.anymap_get::<MioPoll>();

        let this = cx.this().clone();
        let fwd = fwd_do!(move |_| call!([this], handle_inbound()));
        let inbound_src = match poll.add(
            FdSource::new(links.inbound.as_raw_fd()),
            Interest::READABLE,
            PRI,
            fwd,
        ) {
            Ok(v) => v,
            Err(e) => return Self::init_failed(cx, &done, e.into()),
        };

        let this = cx.this().clone();
        let notify = fwd_do!(move |sig: ControlSignal| call!([this], handle_control(sig)));
        let controls = match ControlGlue::new(&poll, notify) {
            Ok(v) => v,
            Err(e) => return Self::init_failed(cx, &done, e.into()),
        };

        tracing::info!(parent = role.parent(), "transformer ready");
        let this = Self {
            role,
            links,
            _inbound_src: inbound_src,
            _controls: controls,
            scratch: vec![0; READ_CHUNK],
            done,
            finished: false,
        };
        // Lines may have been queued before the source was registered
        call!([cx], handle_inbound());
        Some(this)
    }

    fn init_failed(cx: CX![], done: &Fwd<Outcome>, e: PipelineError) -> Option<Self> {
        tracing::error!("transformer start-up failed: {}", e);
        fwd!([done], Outcome::Failed);
        cx.fail(e);
        None
    }

    fn handle_inbound(&mut self, cx: CX![]) {
        if self.finished {
            return;
        }
        match self.pump() {
            Ok(Drain::Idle) => (),
            Ok(Drain::Closed) => {
                tracing::info!("line channel closed");
                self.finish(cx, Outcome::Success);
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
                // Lines already queued are still delivered
                let outcome = match self.pump() {
                    Ok(_) => Outcome::Success,
                    Err(e) => {
                        tracing::error!("transport failure while draining: {}", e);
                        Outcome::Failed
                    }
                };
                self.finish(cx, outcome);
            }
        }
    }

    // Translate every line available right now
    fn pump(&mut self) -> Result<Drain, PipelineError> {
        let outbound = &mut self.links.outbound;
        self.links.inbound.drain(&mut self.scratch, |line| {
            let out = translate(line.as_bytes());
            tracing::trace!(len = line.as_bytes().len(), out = out.len(), "translated");
            outbound.write(&Message::new(out))
        })
    }

    fn finish(&mut self, cx: CX![], outcome: Outcome) {
        self.finished = true;
        tracing::info!(?outcome, role = %self.role.kind(), "stopping");
        fwd!([self.done], outcome);
        cx.stop();
    }
}
