use crate::frame::FrameError;
use crate::role::RoleKind;
use thiserror::Error;

/// Errors raised by the pipeline roles and their channels
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Failed to spawn {role}: {source}")]
    Spawn {
        role: RoleKind,
        source: std::io::Error,
    },

    #[error("Invalid launch environment: {0}")]
    Launch(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0} role may not originate control signals")]
    NotCoordinator(RoleKind),
}

impl PipelineError {
    /// True for an orderly end-of-stream rather than a real failure
    pub fn is_closed(&self) -> bool {
        matches!(self, PipelineError::ChannelClosed)
    }
}
