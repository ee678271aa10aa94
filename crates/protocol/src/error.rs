//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to parse an incoming message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A resize carried unusable dimensions.
    #[error("invalid terminal dimensions: {rows} rows x {cols} cols")]
    InvalidDimensions {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
