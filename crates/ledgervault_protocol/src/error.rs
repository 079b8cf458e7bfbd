//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while handling keys, signatures and wire payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A public or secret key had the wrong length or was not a valid point.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A signature had the wrong length or could not be parsed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The signature did not verify against the claimed key.
    #[error("signature does not match payload")]
    SignatureMismatch,

    /// A value could not be encoded (base64, hex, CBOR).
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A value could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProtocolError {
    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Creates an invalid key error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            ProtocolError::SignatureMismatch.to_string(),
            "signature does not match payload"
        );
        assert!(ProtocolError::decode("bad cbor")
            .to_string()
            .contains("bad cbor"));
    }
}
