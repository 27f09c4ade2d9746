//! Common error types for callfx.

use thiserror::Error;

/// Result type alias using callfx's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for callfx operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Signaling channel read/write failed
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Peer transport reported a failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Inference model failed or is unavailable
    #[error("inference error: {0}")]
    Inference(String),

    /// Image decode/encode failure
    #[error("image error: {0}")]
    Image(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a signaling error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create an inference error from any displayable type.
    pub fn inference(msg: impl std::fmt::Display) -> Self {
        Self::Inference(msg.to_string())
    }

    /// Create an image error from any displayable type.
    pub fn image(msg: impl std::fmt::Display) -> Self {
        Self::Image(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an invalid-state error from any displayable type.
    pub fn invalid_state(msg: impl std::fmt::Display) -> Self {
        Self::InvalidState(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
