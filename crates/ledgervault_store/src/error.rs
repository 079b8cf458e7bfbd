//! Store error types.

use crate::backend::StorageError;
use ledgervault_protocol::ProtocolError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the vault store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed.
    #[error("storage error: {0}")]
    Io(#[from] StorageError),

    /// The journal holds bytes that are not a valid record.
    #[error("journal corrupted: {0}")]
    Corrupted(String),

    /// A row with the same key already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A referenced row does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A write would violate a table constraint.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Another process holds the store directory.
    #[error("store directory is locked by another process")]
    Locked,
}

impl StoreError {
    /// Creates a constraint violation.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint(message.into())
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Returns true if the error is caused by the caller's input rather
    /// than by the store itself.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists(_) | Self::NotFound(_) | Self::Constraint(_)
        )
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(StorageError::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_distinguished_from_failures() {
        assert!(StoreError::constraint("hlc regression").is_rejection());
        assert!(StoreError::not_found("vault").is_rejection());
        assert!(!StoreError::Corrupted("bad crc".into()).is_rejection());
        assert!(!StoreError::Io(StorageError::Closed).is_rejection());
    }

    #[test]
    fn display_names_the_row() {
        let err = StoreError::AlreadyExists("vault 42".into());
        assert_eq!(err.to_string(), "vault 42 already exists");
    }
}
