//! Error types for the client.

use ledgervault_protocol::{ErrorBody, ErrorKind, ProtocolError, VaultId};
use ledgervault_server::ServerError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The request did not reach the server or the reply was lost.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server rejected the request.
    #[error("server error ({kind:?}): {message}")]
    Server {
        /// Machine-readable kind.
        kind: ErrorKind,
        /// Server message.
        message: String,
    },

    /// Encoding, decoding or key material error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Encryption, decryption or key wrapping failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// No usable vault key for this vault or epoch.
    #[error("no vault key for vault {vault_id} at epoch {key_epoch}")]
    NoVaultKey {
        /// Vault id.
        vault_id: VaultId,
        /// Missing epoch.
        key_epoch: u32,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a crypto error.
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Returns true if an idempotent operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::Server { kind, .. } => {
                matches!(kind, ErrorKind::StorageFailure | ErrorKind::Internal)
            }
            _ => false,
        }
    }

    /// Server error kind, if the server produced this error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Server { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<ErrorBody> for ClientError {
    fn from(body: ErrorBody) -> Self {
        ClientError::Server {
            kind: body.kind,
            message: body.message,
        }
    }
}

impl From<ServerError> for ClientError {
    fn from(err: ServerError) -> Self {
        ClientError::from(err.to_body(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ClientError::transport_retryable("connection reset").is_retryable());
        assert!(!ClientError::transport_fatal("bad certificate").is_retryable());
        let storage = ClientError::Server {
            kind: ErrorKind::StorageFailure,
            message: "storage failure".into(),
        };
        assert!(storage.is_retryable());
        let denied = ClientError::Server {
            kind: ErrorKind::Forbidden,
            message: "no".into(),
        };
        assert!(!denied.is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
    }

    #[test]
    fn server_errors_keep_their_kind() {
        let err = ClientError::from(ServerError::NotFound("vault not found".into()));
        assert_eq!(err.kind(), Some(ErrorKind::NotFound));
    }
}
