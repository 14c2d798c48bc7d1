//! Error types shared across the playback crates.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A component was used before `initialize` completed.
    #[error("source not initialized")]
    Uninitialized,

    /// An internal invariant was broken. These indicate a programming
    /// error and are never retried.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The underlying source failed to read.
    #[error("source error: {0}")]
    Source(String),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Error::Source(msg.into())
    }
}
