//! Three-process keystroke pipeline for Stakker
//!
//! Keystrokes are read by one process, rewritten by a second and
//! shown by a third.  The processes talk only through one-way pipes
//! and are shut down through signals.
//!
//! ## Roles
//!
//! - **Capture** reads the keyboard one unit at a time.  Each unit is
//!   echoed to Renderer immediately, and ordinary units build up a
//!   line which is sent to Transformer when the submit unit arrives.
//!   Capture is the root of the process tree and the only role that
//!   signals the others.
//!
//! - **Transformer** rewrites each submitted line through a fixed
//!   rule table (`a` and `z` swapped, `X` backspace, `K` kill-line)
//!   and sends the result on to Renderer.
//!
//! - **Renderer** writes echoed units and transformed lines to
//!   stdout, serving both inbound channels without letting either
//!   hold up the other.
//!
//! ## Channels
//!
//! There are exactly three channels, each with one writer and one
//! reader: Capture to Renderer (echo), Capture to Transformer (line)
//! and Transformer to Renderer (line).  Messages are framed either as
//! legacy fixed-size zero-padded frames or with a 2-byte length
//! prefix, see [`Framing`].
//!
//! ## Shutdown
//!
//! The kill unit (Ctrl-K by default) interrupts all three roles,
//! Capture included, and the process exits with status 130.  The
//! terminate unit (`T` by default) or end of input closes Capture's
//! channel ends, asks the other two roles to finish what is queued,
//! and exits with status 0.  Capture reaps both children on every
//! exit path and restores the terminal mode it changed at start-up.

#![deny(rust_2018_idioms)]

mod capture;
mod channel;
mod config;
mod error;
mod frame;
mod renderer;
mod role;
mod runtime;
mod spawn;
mod terminal;
mod termout;
mod transformer;

pub use capture::{LineEditor, Phase, Step, Unit};
pub use channel::{create as create_channel, Drain, ReadEnd, WriteEnd};
pub use config::{Config, Keys, CONFIG_FILE};
pub use error::PipelineError;
pub use frame::{FrameDecoder, FrameError, FrameSpec, Framing, Message};
pub use renderer::Feeds;
pub use role::{ControlSignal, Outcome, Peer, ProcessRole, RoleKind};
pub use spawn::{RendererLinks, Spawned, TransformerLinks};
pub use terminal::RawMode;
pub use termout::TermOut;
pub use transformer::translate;

/// Entry points for each role's process
pub mod roles {
    pub use crate::capture::run as capture;
    pub use crate::renderer::run as renderer;
    pub use crate::transformer::run as transformer;
}

#[cfg(unix)]
mod os_mio_unix;
#[cfg(unix)]
use os_mio_unix as os_glue;

#[cfg(not(unix))]
std::compile_error!("OS interface not yet implemented on this platform");
