//! Error types for the TapeIO offer
//!
//! Every fallible operation of the offer maps onto one of a handful of
//! failure classes. Callers decide on retries from the class, never from
//! the message.

use thiserror::Error;

/// Common result type for TapeIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for TapeIO
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid client input (empty, oversized or duplicated request items)
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Metadata store unreachable or unable to (de)serialize a record
    #[error("referential error: {0}")]
    Referential(String),

    /// Digest or offset mismatch, or any state that implies corruption
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Optimistic concurrency conflict that outlived its retry budget
    #[error("concurrent update conflict: {0}")]
    Concurrency(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The object exists but its archive is not on disk
    #[error("object unavailable: {0}")]
    Unavailable(String),

    /// Misuse of an API or a broken internal invariant
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a referential error
    pub fn referential(msg: impl Into<String>) -> Self {
        Self::Referential(msg.into())
    }

    /// Create an integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// Referential faults and plain I/O errors may go away on their own.
    /// Integrity faults and programming errors never do.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Referential(_) | Self::Io(_) | Self::Concurrency(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this error indicates corruption
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}
