//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// JSON (de)serialization failed, including unknown frame kinds.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error while reading or writing a byte stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The buffer ended before the announced length.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// A zero-length frame was announced.
    #[error("empty message")]
    EmptyMessage,

    /// A snapshot lacked a field required to build room state.
    #[error("missing field: {0}")]
    MissingField(&'static str),
}
