use crate::error::PipelineError;
use libc::c_int;
use std::fmt;
use std::io::{Error, Result};

/// The three process roles of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum RoleKind {
    Capture,
    Transformer,
    Renderer,
}

impl RoleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Capture => "capture",
            RoleKind::Transformer => "transformer",
            RoleKind::Renderer => "renderer",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band notice sent by Capture to end the other roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Stop now, discarding anything pending
    Interrupt,
    /// Finish what is already queued, then stop
    Terminate,
}

impl ControlSignal {
    pub const ALL: [ControlSignal; 2] = [ControlSignal::Interrupt, ControlSignal::Terminate];

    pub fn signo(self) -> c_int {
        match self {
            ControlSignal::Interrupt => libc::SIGINT,
            ControlSignal::Terminate => libc::SIGTERM,
        }
    }

    /// Deliver to a process.  Fire-and-forget: no acknowledgement.
    fn send(self, pid: u32) -> Result<()> {
        if -1 == unsafe { libc::kill(pid as libc::pid_t, self.signo()) } {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

/// Another role's process, as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub kind: RoleKind,
    pub pid: u32,
}

/// Identity of the current process within the pipeline.  Built once
/// at start-up from the launch data and handed to the role's actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRole {
    kind: RoleKind,
    pid: u32,
    parent: u32,
    peers: Vec<Peer>,
}

impl ProcessRole {
    /// The coordinator is its own parent and knows both other roles
    pub fn coordinator(pid: u32, peers: Vec<Peer>) -> Self {
        Self {
            kind: RoleKind::Capture,
            pid,
            parent: pid,
            peers,
        }
    }

    /// A spawned role, which has no one to signal
    pub fn spawned(kind: RoleKind, pid: u32, parent: u32) -> Self {
        Self {
            kind,
            pid,
            parent,
            peers: Vec::new(),
        }
    }

    pub fn kind(&self) -> RoleKind {
        self.kind
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn parent(&self) -> u32 {
        self.parent
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn is_coordinator(&self) -> bool {
        self.kind == RoleKind::Capture
    }

    /// Send `sig` to every peer.  All peers are attempted; the first
    /// failure is returned.
    pub fn signal_peers(&self, sig: ControlSignal) -> std::result::Result<(), PipelineError> {
        if !self.is_coordinator() {
            return Err(PipelineError::NotCoordinator(self.kind));
        }
        let mut first_err = None;
        for peer in &self.peers {
            tracing::debug!(peer = %peer.kind, pid = peer.pid, ?sig, "signalling");
            if let Err(e) = sig.send(peer.pid) {
                tracing::warn!(peer = %peer.kind, pid = peer.pid, "signal failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Send `sig` to this process, to be picked up by its own handler
    pub fn signal_self(&self, sig: ControlSignal) -> std::result::Result<(), PipelineError> {
        if !self.is_coordinator() {
            return Err(PipelineError::NotCoordinator(self.kind));
        }
        sig.send(self.pid)?;
        Ok(())
    }
}

/// How a role finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Normal termination or orderly end of the inbound streams
    Success,
    /// Stopped by an Interrupt (kill path)
    Interrupted,
    /// Transport failure or start-up error
    Failed,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Interrupted => 128 + libc::SIGINT,
            Outcome::Failed => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawned_roles_cannot_signal() {
        let role = ProcessRole::spawned(RoleKind::Renderer, 200, 100);
        assert!(matches!(
            role.signal_peers(ControlSignal::Terminate),
            Err(PipelineError::NotCoordinator(RoleKind::Renderer))
        ));
        assert!(role.signal_self(ControlSignal::Interrupt).is_err());
        assert!(role.peers().is_empty());
    }

    #[test]
    fn test_coordinator_is_own_parent() {
        let peers = vec![
            Peer {
                kind: RoleKind::Renderer,
                pid: 11,
            },
            Peer {
                kind: RoleKind::Transformer,
                pid: 12,
            },
        ];
        let role = ProcessRole::coordinator(10, peers);
        assert_eq!(role.parent(), role.pid());
        assert_eq!(role.peers().len(), 2);
    }

    #[test]
    fn test_coordinator_with_no_peers_signals_nothing() {
        let role = ProcessRole::coordinator(std::process::id(), Vec::new());
        assert!(role.signal_peers(ControlSignal::Terminate).is_ok());
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(ControlSignal::Interrupt.signo(), libc::SIGINT);
        assert_eq!(ControlSignal::Terminate.signo(), libc::SIGTERM);
        assert_eq!(Outcome::Success.exit_code(), 0);
        assert_eq!(Outcome::Interrupted.exit_code(), 130);
        assert_eq!(Outcome::Failed.exit_code(), 1);
    }
}
