//! Error types for the vault server.

use ledgervault_protocol::{ErrorBody, ErrorKind, ProtocolError};
use ledgervault_store::StoreError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors returned by server operations.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Missing, malformed, forged or stale signature.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but the caller's role does not allow the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The vault or membership does not exist, or the caller is not a
    /// member. The two cases are deliberately indistinguishable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input or a disallowed operation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The store failed. The operation may not have been applied.
    #[error("storage failure: {0}")]
    StorageFailure(#[source] StoreError),

    /// Unexpected fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Unauthorized(_) => ErrorKind::Unauthorized,
            ServerError::Forbidden(_) => ErrorKind::Forbidden,
            ServerError::NotFound(_) => ErrorKind::NotFound,
            ServerError::BadRequest(_) => ErrorKind::BadRequest,
            ServerError::StorageFailure(_) => ErrorKind::StorageFailure,
            ServerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status code.
    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::Unauthorized(_)
                | ServerError::Forbidden(_)
                | ServerError::NotFound(_)
                | ServerError::BadRequest(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Builds the response body. Server-side details are replaced by a
    /// generic message unless `expose_details` is set.
    pub fn to_body(&self, expose_details: bool) -> ErrorBody {
        let message = if self.is_client_error() || expose_details {
            self.to_string()
        } else {
            match self.kind() {
                ErrorKind::StorageFailure => "storage failure".to_string(),
                _ => "internal server error".to_string(),
            }
        };
        ErrorBody {
            kind: self.kind(),
            message,
        }
    }

    pub(crate) fn not_found_vault() -> Self {
        ServerError::NotFound("vault not found".into())
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ServerError::NotFound(what),
            StoreError::AlreadyExists(what) => ServerError::BadRequest(format!("{what} already exists")),
            StoreError::Constraint(message) => ServerError::BadRequest(message),
            other => ServerError::StorageFailure(other),
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        ServerError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::BadRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(ServerError::StorageFailure(StoreError::Locked).is_server_error());
        assert_eq!(ServerError::Forbidden("x".into()).http_status(), 403);
        assert_eq!(ServerError::not_found_vault().http_status(), 404);
    }

    #[test]
    fn store_errors_map_by_cause() {
        let e: ServerError = StoreError::constraint("stale epoch").into();
        assert_eq!(e.kind(), ErrorKind::BadRequest);
        let e: ServerError = StoreError::not_found("vault").into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        let e: ServerError = StoreError::Corrupted("crc".into()).into();
        assert_eq!(e.kind(), ErrorKind::StorageFailure);
    }

    #[test]
    fn details_hidden_in_production() {
        let err = ServerError::StorageFailure(StoreError::Corrupted("crc at 42".into()));
        let body = err.to_body(false);
        assert_eq!(body.kind, ErrorKind::StorageFailure);
        assert!(!body.message.contains("42"));
        assert!(err.to_body(true).message.contains("42"));

        let client = ServerError::BadRequest("payload too large".into());
        assert!(client.to_body(false).message.contains("payload too large"));
    }
}
