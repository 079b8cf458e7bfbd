//! Vault key sealing and key wrapping.
//!
//! Payloads are sealed with the vault key (AES-256-GCM). A sealed blob is
//! `key_epoch (4 bytes, big-endian) || nonce (12) || ciphertext`, with the
//! vault id bound as associated data so a blob cannot be replayed into
//! another vault.
//!
//! Vault keys are shared by wrapping them to a device's X25519 public key:
//! an ephemeral X25519 secret is agreed with the recipient, HKDF-SHA256
//! derives a one-shot AES-256-GCM key, and the wrapped form is
//! `ephemeral_public (32) || nonce (12) || ciphertext`. The plaintext is
//! the current key plus every retired epoch key.

use crate::error::{ClientError, ClientResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use ledgervault_protocol::{from_cbor, to_cbor, VaultId};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Vault key size in bytes.
pub const VAULT_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// X25519 public key size in bytes.
pub const ENC_PUBLIC_KEY_SIZE: usize = 32;

const EPOCH_PREFIX: usize = 4;
const WRAP_INFO: &[u8] = b"ledgervault-wrap-v1";

/// A symmetric vault key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey([u8; VAULT_KEY_SIZE]);

impl VaultKey {
    /// Generates a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; VAULT_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> ClientResult<Self> {
        let bytes: [u8; VAULT_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| ClientError::crypto(format!("vault key must be {VAULT_KEY_SIZE} bytes")))?;
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; VAULT_KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Encrypts `plaintext` under `key_epoch`, bound to `vault_id`.
    pub fn seal(&self, vault_id: &VaultId, key_epoch: u32, plaintext: &[u8]) -> ClientResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let aad = sealing_aad(vault_id, key_epoch);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            .map_err(|_| ClientError::crypto("encryption failed"))?;

        let mut sealed = Vec::with_capacity(EPOCH_PREFIX + NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&key_epoch.to_be_bytes());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts a blob produced by [`VaultKey::seal`].
    pub fn open(&self, vault_id: &VaultId, sealed: &[u8]) -> ClientResult<Vec<u8>> {
        let (key_epoch, nonce, ciphertext) = split_sealed(sealed)?;
        let aad = sealing_aad(vault_id, key_epoch);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
            .map_err(|_| ClientError::crypto("decryption failed"))
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

impl PartialEq for VaultKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for VaultKey {}

fn sealing_aad(vault_id: &VaultId, key_epoch: u32) -> Vec<u8> {
    let mut aad = vault_id.as_uuid().as_bytes().to_vec();
    aad.extend_from_slice(&key_epoch.to_be_bytes());
    aad
}

fn split_sealed(sealed: &[u8]) -> ClientResult<(u32, &[u8], &[u8])> {
    if sealed.len() < EPOCH_PREFIX + NONCE_SIZE {
        return Err(ClientError::crypto("sealed payload is truncated"));
    }
    let (epoch, rest) = sealed.split_at(EPOCH_PREFIX);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
    let mut epoch_bytes = [0u8; EPOCH_PREFIX];
    epoch_bytes.copy_from_slice(epoch);
    Ok((u32::from_be_bytes(epoch_bytes), nonce, ciphertext))
}

/// Reads the key epoch prefix of a sealed blob.
pub fn sealed_epoch(sealed: &[u8]) -> ClientResult<u32> {
    split_sealed(sealed).map(|(epoch, _, _)| epoch)
}

/// A device's X25519 key-encapsulation keypair.
pub struct EncryptionKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EncryptionKeypair {
    /// Generates a fresh keypair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Derives a keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(seed))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Secret bytes, for persisting the keypair.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Public key bytes, published in memberships.
    pub fn public_key(&self) -> [u8; ENC_PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }
}

impl fmt::Debug for EncryptionKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKeypair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

fn parse_public(bytes: &[u8]) -> ClientResult<PublicKey> {
    let bytes: [u8; ENC_PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
        ClientError::crypto(format!(
            "encryption public key must be {ENC_PUBLIC_KEY_SIZE} bytes"
        ))
    })?;
    Ok(PublicKey::from(bytes))
}

fn wrapping_cipher(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> ClientResult<Aes256Gcm> {
    let mut salt = Vec::with_capacity(2 * ENC_PUBLIC_KEY_SIZE);
    salt.extend_from_slice(ephemeral.as_bytes());
    salt.extend_from_slice(recipient.as_bytes());
    let mut okm = [0u8; VAULT_KEY_SIZE];
    Hkdf::<Sha256>::new(Some(salt.as_slice()), shared)
        .expand(WRAP_INFO, &mut okm)
        .map_err(|_| ClientError::crypto("key derivation failed"))?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&okm));
    okm.zeroize();
    Ok(cipher)
}

/// Encrypts `secret` for the holder of `recipient_public`.
fn wrap_secret(secret: &[u8], recipient_public: &[u8]) -> ClientResult<Vec<u8>> {
    let recipient = parse_public(recipient_public)?;
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);
    let cipher = wrapping_cipher(shared.as_bytes(), &ephemeral_public, &recipient)?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), secret)
        .map_err(|_| ClientError::crypto("key wrapping failed"))?;

    let mut wrapped = Vec::with_capacity(ENC_PUBLIC_KEY_SIZE + NONCE_SIZE + ciphertext.len());
    wrapped.extend_from_slice(ephemeral_public.as_bytes());
    wrapped.extend_from_slice(&nonce);
    wrapped.extend_from_slice(&ciphertext);
    Ok(wrapped)
}

fn unwrap_secret(wrapped: &[u8], keypair: &EncryptionKeypair) -> ClientResult<Vec<u8>> {
    if wrapped.len() < ENC_PUBLIC_KEY_SIZE + NONCE_SIZE {
        return Err(ClientError::crypto("wrapped key is truncated"));
    }
    let (ephemeral, rest) = wrapped.split_at(ENC_PUBLIC_KEY_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
    let ephemeral = parse_public(ephemeral)?;
    let shared = keypair.secret.diffie_hellman(&ephemeral);
    let cipher = wrapping_cipher(shared.as_bytes(), &ephemeral, &keypair.public)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ClientError::crypto("key unwrapping failed"))
}

/// Plaintext of a wrapped key set. The current key's epoch is not stored:
/// it is the epoch of the membership row carrying the blob.
#[derive(Serialize, Deserialize, Zeroize)]
struct WrappedKeys {
    current: Vec<u8>,
    history: Vec<EpochKey>,
}

impl WrappedKeys {
    fn to_ring(&self, key_epoch: u32) -> ClientResult<KeyRing> {
        let mut ring = KeyRing::new();
        for entry in &self.history {
            ring.insert(entry.epoch, VaultKey::from_bytes(&entry.key)?);
        }
        ring.insert(key_epoch, VaultKey::from_bytes(&self.current)?);
        Ok(ring)
    }
}

#[derive(Serialize, Deserialize, Zeroize)]
struct EpochKey {
    epoch: u32,
    key: Vec<u8>,
}

/// Wraps `current` together with every key of `history` for the holder of
/// `recipient_public`.
///
/// Membership rows keep only the latest wrapped blob, so retired epochs
/// travel inside it. Any member holding the row can read the whole log.
pub fn wrap_vault_keys(
    current: &VaultKey,
    history: &KeyRing,
    recipient_public: &[u8],
) -> ClientResult<Vec<u8>> {
    let mut keys = WrappedKeys {
        current: current.as_bytes().to_vec(),
        history: history
            .keys
            .iter()
            .map(|(epoch, key)| EpochKey {
                epoch: *epoch,
                key: key.as_bytes().to_vec(),
            })
            .collect(),
    };
    let encoded = to_cbor(&keys);
    keys.zeroize();
    let mut encoded = encoded?;
    let wrapped = wrap_secret(&encoded, recipient_public);
    encoded.zeroize();
    wrapped
}

/// Unwraps a blob produced by [`wrap_vault_keys`]. The current key is
/// filed under `key_epoch`.
pub fn unwrap_vault_keys(
    wrapped: &[u8],
    key_epoch: u32,
    keypair: &EncryptionKeypair,
) -> ClientResult<KeyRing> {
    let mut plaintext = unwrap_secret(wrapped, keypair)?;
    let decoded = from_cbor::<WrappedKeys>(&plaintext);
    plaintext.zeroize();
    let mut keys = decoded?;

    let ring = keys.to_ring(key_epoch);
    keys.zeroize();
    ring
}

/// Vault keys by epoch. Older epochs stay available to read history.
#[derive(Debug, Default, Clone)]
pub struct KeyRing {
    keys: BTreeMap<u32, VaultKey>,
}

impl KeyRing {
    /// Creates an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the key of an epoch.
    pub fn insert(&mut self, key_epoch: u32, key: VaultKey) {
        self.keys.insert(key_epoch, key);
    }

    /// Key of an epoch.
    pub fn get(&self, key_epoch: u32) -> Option<&VaultKey> {
        self.keys.get(&key_epoch)
    }

    /// Newest epoch and its key.
    pub fn current(&self) -> Option<(u32, &VaultKey)> {
        self.keys.iter().next_back().map(|(epoch, key)| (*epoch, key))
    }

    /// Adds every key of `other`, replacing epochs already held.
    pub fn merge(&mut self, other: &KeyRing) {
        for (epoch, key) in &other.keys {
            self.keys.insert(*epoch, key.clone());
        }
    }

    /// Number of epochs held.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the ring holds no key.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Seals under the newest key.
    pub fn seal(&self, vault_id: &VaultId, plaintext: &[u8]) -> ClientResult<(u32, Vec<u8>)> {
        let (epoch, key) = self.current().ok_or(ClientError::NoVaultKey {
            vault_id: *vault_id,
            key_epoch: 0,
        })?;
        Ok((epoch, key.seal(vault_id, epoch, plaintext)?))
    }

    /// Opens with the key named by the blob's epoch prefix.
    pub fn open(&self, vault_id: &VaultId, sealed: &[u8]) -> ClientResult<Vec<u8>> {
        let key_epoch = sealed_epoch(sealed)?;
        let key = self.get(key_epoch).ok_or(ClientError::NoVaultKey {
            vault_id: *vault_id,
            key_epoch,
        })?;
        key.open(vault_id, sealed)
    }
}
