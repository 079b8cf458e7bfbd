//! Invite tickets passed out of band from inviter to invitee.

use crate::crypto::EncryptionKeypair;
use crate::error::{ClientError, ClientResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use ledgervault_protocol::{from_cbor, to_cbor, DeviceKeypair, InviteId, VaultId};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroize;

const INVITE_ENC_INFO: &[u8] = b"ledgervault-invite-enc-v1";

/// Everything an invitee needs to join a vault.
///
/// The ticket carries the invite's signing secret, so it grants membership
/// to whoever holds it until it is accepted or expires.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteTicket {
    /// Vault being joined.
    pub vault_id: VaultId,
    /// Server-side invite id.
    pub invite_id: InviteId,
    /// Key epoch of the wrapped key.
    pub key_epoch: u32,
    /// Secret of the one-time invite key.
    pub invite_secret: Vec<u8>,
    /// Vault key wrapped for the invite's encryption key.
    pub encrypted_vault_key: Vec<u8>,
}

impl InviteTicket {
    /// Encodes the ticket as URL-safe base64 text.
    pub fn encode(&self) -> ClientResult<String> {
        Ok(URL_SAFE_NO_PAD.encode(to_cbor(self)?))
    }

    /// Parses a ticket produced by [`InviteTicket::encode`].
    pub fn decode(text: &str) -> ClientResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| ClientError::crypto(format!("invalid invite ticket: {e}")))?;
        Ok(from_cbor(&bytes)?)
    }

    /// The one-time signing key proving possession of the invite.
    pub fn signing_key(&self) -> ClientResult<DeviceKeypair> {
        Ok(DeviceKeypair::from_secret_bytes(&self.invite_secret)?)
    }

    /// The encryption keypair the vault key was wrapped for.
    pub fn encryption_key(&self) -> ClientResult<EncryptionKeypair> {
        invite_encryption_key(&self.invite_secret)
    }
}

impl Drop for InviteTicket {
    fn drop(&mut self) {
        self.invite_secret.zeroize();
    }
}

impl fmt::Debug for InviteTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteTicket")
            .field("vault_id", &self.vault_id)
            .field("invite_id", &self.invite_id)
            .field("key_epoch", &self.key_epoch)
            .finish_non_exhaustive()
    }
}

/// Derives the invite's X25519 keypair from its signing secret.
pub(crate) fn invite_encryption_key(invite_secret: &[u8]) -> ClientResult<EncryptionKeypair> {
    let mut seed = [0u8; 32];
    Hkdf::<Sha256>::new(None, invite_secret)
        .expand(INVITE_ENC_INFO, &mut seed)
        .map_err(|_| ClientError::crypto("key derivation failed"))?;
    let keypair = EncryptionKeypair::from_seed(seed);
    seed.zeroize();
    Ok(keypair)
}
