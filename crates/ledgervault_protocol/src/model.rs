//! Durable data model shared by the store, the server and clients.
//!
//! All `encrypted_*` fields are opaque to the server. Timestamps named
//! `*_at` are epoch milliseconds taken from the server clock.

use crate::hlc::{HlcTimestamp, UpdatePosition};
use crate::identity::{DevicePublicKey, PubkeyHash};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ProtocolError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| ProtocolError::decode(e.to_string()))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a vault.
    VaultId
);

uuid_id!(
    /// Identifier of a pending invite.
    InviteId
);

/// Role of a member within a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May remove members, rekey, invite and delete the vault.
    Owner,
    /// May read and append.
    Member,
}

impl Role {
    /// Returns true for the owner role.
    #[must_use]
    pub fn is_owner(self) -> bool {
        matches!(self, Role::Owner)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Owner => f.write_str("owner"),
            Role::Member => f.write_str("member"),
        }
    }
}

/// A collaborative namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    /// Vault id.
    pub id: VaultId,
    /// Generation of the current vault key. Incremented by every rekey.
    pub key_epoch: u32,
    /// Highest update id that has been pruned from the log.
    pub pruned_through: u64,
    /// Creation time.
    pub created_at: u64,
}

/// One (vault, identity) pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultMembership {
    /// Vault id.
    pub vault_id: VaultId,
    /// Member identity.
    pub pubkey_hash: PubkeyHash,
    /// Member role.
    pub role: Role,
    /// Vault key wrapped for this member. Cleared when a rekey could not
    /// reach the member.
    pub encrypted_vault_key: Option<Vec<u8>>,
    /// Member's key-encapsulation public key.
    pub enc_public_key: Option<Vec<u8>>,
    /// Key epoch of `encrypted_vault_key`.
    pub key_epoch: u32,
    /// Join time.
    pub joined_at: u64,
}

/// A single-use, time-bounded pending membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultInvite {
    /// Invite id.
    pub id: InviteId,
    /// Vault id.
    pub vault_id: VaultId,
    /// Public key whose secret is handed to the invitee out of band.
    pub invite_pubkey: DevicePublicKey,
    /// Vault key wrapped for the invite key.
    pub encrypted_vault_key: Vec<u8>,
    /// Role granted on acceptance.
    pub role: Role,
    /// Inviting member.
    pub created_by: PubkeyHash,
    /// Creation time.
    pub created_at: u64,
    /// Expiry time.
    pub expires_at: u64,
}

impl VaultInvite {
    /// Returns true once `now` has reached the expiry.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// A compacted full-state checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    /// Store-assigned id.
    pub id: u64,
    /// Vault id.
    pub vault_id: VaultId,
    /// Snapshot version, strictly increasing per vault. Genesis is 0.
    pub version: u64,
    /// HLC of the newest update folded in (or of creation for genesis).
    pub hlc_timestamp: HlcTimestamp,
    /// Highest update id folded into this snapshot.
    pub covers_through: u64,
    /// Encrypted state.
    pub encrypted_data: Vec<u8>,
    /// Creation time.
    pub created_at: u64,
}

/// An immutable appended delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultUpdate {
    /// Store-assigned insertion id, strictly increasing.
    pub id: u64,
    /// Vault id.
    pub vault_id: VaultId,
    /// Snapshot version the author based this update on.
    pub base_snapshot_version: u64,
    /// Author's HLC timestamp.
    pub hlc_timestamp: HlcTimestamp,
    /// Author identity.
    pub author_pubkey_hash: PubkeyHash,
    /// Vault key epoch that encrypted the payload.
    pub key_epoch: u32,
    /// Encrypted delta.
    pub encrypted_data: Vec<u8>,
    /// Insertion time.
    pub created_at: u64,
}

impl VaultUpdate {
    /// Returns the total-order position of this update.
    #[must_use]
    pub fn position(&self) -> UpdatePosition {
        UpdatePosition::new(self.hlc_timestamp, self.id)
    }
}

/// Per-device wrapped identity material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    /// Owner identity.
    pub pubkey_hash: PubkeyHash,
    /// Encrypted keypair and settings.
    pub encrypted_data: Vec<u8>,
    /// Device fingerprint supplied by the client.
    pub device_fingerprint: String,
    /// Last write time.
    pub updated_at: u64,
}

/// A member as returned by `membership.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member identity.
    pub pubkey_hash: PubkeyHash,
    /// Member role.
    pub role: Role,
    /// Key-encapsulation public key, if enrolled.
    pub enc_public_key: Option<Vec<u8>>,
    /// Key epoch of the member's wrapped key.
    pub key_epoch: u32,
}

impl From<&VaultMembership> for MemberInfo {
    fn from(m: &VaultMembership) -> Self {
        Self {
            pubkey_hash: m.pubkey_hash,
            role: m.role,
            enc_public_key: m.enc_public_key.clone(),
            key_epoch: m.key_epoch,
        }
    }
}

/// A remaining member that can receive a freshly wrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyTarget {
    /// Member identity.
    pub pubkey_hash: PubkeyHash,
    /// Key-encapsulation public key.
    pub enc_public_key: Vec<u8>,
}

/// A new vault key wrapped for one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberKey {
    /// Member identity.
    pub pubkey_hash: PubkeyHash,
    /// Wrapped vault key.
    pub encrypted_vault_key: Vec<u8>,
}
