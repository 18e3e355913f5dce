//! Error types for the peer protocol.

use thiserror::Error;

/// Result type for peer protocol operations.
pub type PeerResult<T> = Result<T, PeerError>;

/// Errors that can occur encoding or routing peer messages.
#[derive(Error, Debug)]
pub enum PeerError {
    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The message decoded but is not valid for its context.
    #[error("invalid peer message: {0}")]
    InvalidMessage(String),

    /// The peer side of the channel is gone.
    #[error("peer disconnected")]
    Disconnected,
}

impl PeerError {
    /// Creates an invalid message error.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }
}
