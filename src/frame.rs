//! Frame encoding for the role channels
//!
//! Two wire formats are supported.  The legacy `Fixed` format sends
//! every message as a zero-padded frame of exactly the channel's
//! frame size, with no header: the size is the framing.  The
//! `LengthPrefixed` format sends a 2-byte little-endian length
//! followed by the payload.
//!
//! ```text
//! Fixed:           | payload | 0 0 0 ... 0 |   (exactly `size` bytes)
//! LengthPrefixed:  | len (2 LE) | payload  |   (len <= size)
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes used by the length header of `LengthPrefixed` frames
pub const HEADER_LEN: usize = 2;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("Stream ended inside a frame ({0} bytes pending)")]
    Truncated(usize),
}

/// Wire format used on every channel of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Zero-padded fixed-size frames, no header
    #[default]
    Fixed,
    /// 2-byte length header followed by the payload
    LengthPrefixed,
}

/// How the content of a fixed frame is recovered from its padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Content {
    /// One input unit: the first byte of the frame
    Unit,
    /// Text up to the first NUL byte, or the whole frame
    Text,
}

/// A single message carried on a channel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message(Vec<u8>);

impl Message {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Framing contract of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub framing: Framing,
    pub size: usize,
    pub content: Content,
}

impl FrameSpec {
    /// Layout of single-unit echo frames
    pub fn echo(framing: Framing, size: usize) -> Self {
        Self {
            framing,
            size,
            content: Content::Unit,
        }
    }

    /// Layout of line frames
    pub fn line(framing: Framing, size: usize) -> Self {
        Self {
            framing,
            size,
            content: Content::Text,
        }
    }

    /// Encode a payload into one frame
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        if payload.len() > self.size {
            return Err(FrameError::TooLarge {
                size: payload.len(),
                max: self.size,
            });
        }
        match self.framing {
            Framing::Fixed => {
                let mut frame = vec![0u8; self.size];
                frame[..payload.len()].copy_from_slice(payload);
                Ok(frame)
            }
            Framing::LengthPrefixed => {
                let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
                frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
                frame.extend_from_slice(payload);
                Ok(frame)
            }
        }
    }
}

/// Incremental decoder.  Bytes arrive in arbitrary chunks from the
/// pipe; complete frames are handed out in order.
pub struct FrameDecoder {
    spec: FrameSpec,
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(spec: FrameSpec) -> Self {
        Self {
            spec,
            pending: Vec::new(),
        }
    }

    /// Add raw bytes received from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Take the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<Message>, FrameError> {
        match self.spec.framing {
            Framing::Fixed => {
                if self.pending.len() < self.spec.size {
                    return Ok(None);
                }
                let frame: Vec<u8> = self.pending.drain(..self.spec.size).collect();
                let content = match self.spec.content {
                    Content::Unit => &frame[..frame.len().min(1)],
                    Content::Text => {
                        let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
                        &frame[..end]
                    }
                };
                Ok(Some(Message::from(content)))
            }
            Framing::LengthPrefixed => {
                if self.pending.len() < HEADER_LEN {
                    return Ok(None);
                }
                let len = u16::from_le_bytes([self.pending[0], self.pending[1]]) as usize;
                if len > self.spec.size {
                    return Err(FrameError::TooLarge {
                        size: len,
                        max: self.spec.size,
                    });
                }
                if self.pending.len() < HEADER_LEN + len {
                    return Ok(None);
                }
                let frame: Vec<u8> = self.pending.drain(..HEADER_LEN + len).collect();
                Ok(Some(Message::new(&frame[HEADER_LEN..])))
            }
        }
    }

    /// Called at end-of-stream: any leftover bytes are a cut-off frame
    pub fn finish(&self) -> Result<(), FrameError> {
        match self.pending.len() {
            0 => Ok(()),
            n => Err(FrameError::Truncated(n)),
        }
    }
}
