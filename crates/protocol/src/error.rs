//! Error types for the protocol crate.

use thiserror::Error;

/// Errors raised when talking back to a session channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel was already closed by the transport.
    #[error("channel closed")]
    Closed,
}

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
