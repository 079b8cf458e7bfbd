//! Device identity: Ed25519 keypairs and the derived `pubkeyHash`.
//!
//! A device is identified solely by its signing key. The SHA-256 hash of the
//! raw 32-byte public key is the durable user identifier stored in every
//! membership row; it is rendered as lowercase hex.

use crate::error::{ProtocolError, ProtocolResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// Size of a device public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a device secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of a detached signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a public key hash in bytes.
pub const PUBKEY_HASH_SIZE: usize = 32;

/// A device signing keypair.
///
/// The secret half never leaves the device. It is zeroized on drop by
/// `ed25519-dalek`.
pub struct DeviceKeypair {
    signing: SigningKey,
}

impl DeviceKeypair {
    /// Generates a fresh keypair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores a keypair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut secret: [u8; SECRET_KEY_SIZE] = bytes.try_into().map_err(|_| {
            ProtocolError::invalid_key(format!(
                "secret key must be {SECRET_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        let signing = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Ok(Self { signing })
    }

    /// Returns the secret key bytes. Do not log or transmit them.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.signing.to_bytes()
    }

    /// Returns the public half.
    #[must_use]
    pub fn public_key(&self) -> DevicePublicKey {
        DevicePublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Returns the identifier derived from the public key.
    #[must_use]
    pub fn pubkey_hash(&self) -> PubkeyHash {
        self.public_key().pubkey_hash()
    }

    /// Signs a message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for DeviceKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// An Ed25519 public key as transmitted in the `X-Pubkey` header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePublicKey([u8; PUBLIC_KEY_SIZE]);

impl DevicePublicKey {
    /// Creates a public key from raw bytes, checking it is a valid point.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let raw: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            ProtocolError::invalid_key(format!(
                "public key must be {PUBLIC_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&raw)
            .map_err(|e| ProtocolError::invalid_key(e.to_string()))?;
        Ok(Self(raw))
    }

    /// Parses the standard-alphabet base64 header form.
    pub fn from_base64(encoded: &str) -> ProtocolResult<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| ProtocolError::invalid_key(format!("bad base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Renders the key as standard base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Derives the stable identifier for this key.
    #[must_use]
    pub fn pubkey_hash(&self) -> PubkeyHash {
        let digest = Sha256::digest(self.0);
        PubkeyHash(digest.into())
    }

    /// Verifies a detached signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> ProtocolResult<()> {
        let raw: [u8; SIGNATURE_SIZE] = signature.try_into().map_err(|_| {
            ProtocolError::InvalidSignature(format!(
                "signature must be {SIGNATURE_SIZE} bytes, got {}",
                signature.len()
            ))
        })?;
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| ProtocolError::invalid_key(e.to_string()))?;
        key.verify(message, &Signature::from_bytes(&raw))
            .map_err(|_| ProtocolError::SignatureMismatch)
    }
}

impl fmt::Debug for DevicePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePublicKey({})", self.to_base64())
    }
}

impl Serialize for DevicePublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for DevicePublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 of a device public key; the durable user identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubkeyHash([u8; PUBKEY_HASH_SIZE]);

impl PubkeyHash {
    /// Wraps raw hash bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBKEY_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw hash bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBKEY_HASH_SIZE] {
        &self.0
    }

    /// Lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix used in log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl FromStr for PubkeyHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::decode(e.to_string()))?;
        let raw: [u8; PUBKEY_HASH_SIZE] = bytes.try_into().map_err(|_| {
            ProtocolError::decode(format!("pubkey hash must be {PUBKEY_HASH_SIZE} bytes"))
        })?;
        Ok(Self(raw))
    }
}

impl fmt::Display for PubkeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PubkeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubkeyHash({}..)", self.short())
    }
}

impl Serialize for PubkeyHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PubkeyHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
