//! Error types (thiserror-based).
//!
//! Only configuration and engine failures reach callers. Stream-level damage is
//! described by [`MalformedStream`], which parsers return and orchestrators absorb.

use thiserror::Error;

use crate::types::DecoderState;

/// Errors surfaced by the orchestrators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// No available engine accepts the requested configuration.
    #[error("Unsupported configuration: {0}")]
    Configuration(String),

    /// The Decode Engine failed; the orchestrator is now in `Error`.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Operation not allowed in the current state.
    #[error("{operation} not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: DecoderState,
    },
}

/// Failure reported by a Decode Engine, synchronously or through its output channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Decode engine error: {message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Recoverable stream damage. Never crosses the public API of an orchestrator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedStream {
    #[error("not enough data ({have} of {need} bytes)")]
    Truncated { have: usize, need: usize },

    #[error("missing 00 00 01 start code")]
    BadStartCode,

    #[error("sync word not found")]
    BadSync,

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u32 },

    #[error("CRC mismatch")]
    Crc,
}

/// Drawing failures. The frame is released regardless.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("frame {width}x{height} carries {len} bytes, expected RGBA")]
    PixelsUnavailable { width: u32, height: u32, len: usize },
}
