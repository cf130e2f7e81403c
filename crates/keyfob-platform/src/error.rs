//! Platform integration errors.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Platform errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No byte arrived before the read timeout expired.
    #[error("Read timed out")]
    Timeout,

    /// The peer end of the channel is gone.
    #[error("Channel disconnected")]
    Disconnected,

    /// Non-volatile storage error.
    #[error("Storage error: {0}")]
    Storage(String),
}
