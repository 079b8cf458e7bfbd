//! Canonical request signing.
//!
//! Every mutating request carries three headers:
//!
//! - `X-Pubkey`: base64 Ed25519 public key
//! - `X-Timestamp`: epoch milliseconds, decimal
//! - `X-Signature`: base64 signature over the canonical payload
//!
//! The canonical payload binds the method, the path, the timestamp and a
//! SHA-256 digest of the body:
//!
//! ```text
//! LEDGERVAULT-V1\n<METHOD>\n<path>\n<timestamp>\n<hex(sha256(body))>
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use crate::identity::{DeviceKeypair, DevicePublicKey, PubkeyHash};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Header carrying the base64 public key.
pub const HEADER_PUBKEY: &str = "X-Pubkey";

/// Header carrying the epoch-millisecond timestamp.
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";

/// Header carrying the base64 signature.
pub const HEADER_SIGNATURE: &str = "X-Signature";

/// Domain separator for request payloads.
const REQUEST_DOMAIN: &str = "LEDGERVAULT-V1";

/// Domain separator for invite acceptance proofs.
const INVITE_DOMAIN: &str = "ledgervault-invite-accept";

/// Builds the canonical byte string a request signature covers.
#[must_use]
pub fn signing_payload(method: &str, path: &str, body: &[u8], timestamp_ms: u64) -> Vec<u8> {
    let body_digest = hex::encode(Sha256::digest(body));
    format!(
        "{REQUEST_DOMAIN}\n{}\n{path}\n{timestamp_ms}\n{body_digest}",
        method.to_ascii_uppercase()
    )
    .into_bytes()
}

/// Builds the payload an invitee signs with the invite secret key to prove
/// possession when accepting.
#[must_use]
pub fn invite_accept_payload(invite_id: &str, acceptor: &PubkeyHash) -> Vec<u8> {
    format!("{INVITE_DOMAIN}\n{invite_id}\n{acceptor}").into_bytes()
}

/// The three authentication header values for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// `X-Pubkey` value.
    pub pubkey: String,
    /// `X-Timestamp` value.
    pub timestamp: String,
    /// `X-Signature` value.
    pub signature: String,
}

impl SignedHeaders {
    /// Signs a request with the device key.
    #[must_use]
    pub fn sign(
        keypair: &DeviceKeypair,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp_ms: u64,
    ) -> Self {
        let payload = signing_payload(method, path, body, timestamp_ms);
        Self {
            pubkey: keypair.public_key().to_base64(),
            timestamp: timestamp_ms.to_string(),
            signature: BASE64.encode(keypair.sign(&payload)),
        }
    }

    /// Returns the headers as `(name, value)` pairs.
    #[must_use]
    pub fn into_pairs(self) -> Vec<(String, String)> {
        vec![
            (HEADER_PUBKEY.to_string(), self.pubkey),
            (HEADER_TIMESTAMP.to_string(), self.timestamp),
            (HEADER_SIGNATURE.to_string(), self.signature),
        ]
    }
}

/// Decodes a base64 signature header.
pub fn decode_signature(encoded: &str) -> ProtocolResult<Vec<u8>> {
    BASE64
        .decode(encoded.trim())
        .map_err(|e| ProtocolError::InvalidSignature(format!("bad base64: {e}")))
}

/// Encodes a signature for transport.
#[must_use]
pub fn encode_signature(signature: &[u8]) -> String {
    BASE64.encode(signature)
}

/// Verifies a request signature against the claimed key.
pub fn verify_request(
    public_key: &DevicePublicKey,
    method: &str,
    path: &str,
    body: &[u8],
    timestamp_ms: u64,
    signature: &[u8],
) -> ProtocolResult<()> {
    let payload = signing_payload(method, path, body, timestamp_ms);
    public_key.verify(&payload, signature)
}
