//! Protocol decode errors.

use thiserror::Error;

/// Errors raised while decoding frames and payloads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    /// Creates a payload error from any error type.
    pub fn payload<E: std::fmt::Display>(err: E) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}
