//! Request and response bodies of the logical RPC surface.

use crate::hlc::{HlcTimestamp, UpdatePosition};
use crate::identity::{DevicePublicKey, PubkeyHash};
use crate::model::{
    InviteId, MemberInfo, MemberKey, RekeyTarget, Role, UserData, Vault, VaultId, VaultInvite,
    VaultMembership, VaultSnapshot, VaultUpdate,
};
use serde::{Deserialize, Serialize};

/// Empty acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Always true on success.
    pub ok: bool,
}

impl Ack {
    /// A successful acknowledgement.
    pub const OK: Self = Self { ok: true };
}

/// `vault.create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVaultRequest {
    /// Client-chosen vault id.
    pub vault_id: VaultId,
    /// Vault key wrapped for the creating device.
    pub encrypted_vault_key: Vec<u8>,
    /// Creator's key-encapsulation public key.
    pub enc_public_key: Option<Vec<u8>>,
    /// Encrypted empty state stored as snapshot version 0.
    pub genesis_data: Vec<u8>,
    /// HLC of the genesis snapshot.
    pub genesis_hlc: HlcTimestamp,
}

/// Reply to `vault.create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVaultResponse {
    /// The new vault.
    pub vault: Vault,
}

/// Body naming one vault (`vault.delete`, `membership.list`,
/// `membership.get`, `membership.leave`, `invite.list`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRequest {
    /// Vault id.
    pub vault_id: VaultId,
}

/// Reply to `membership.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMembersResponse {
    /// All current members.
    pub members: Vec<MemberInfo>,
}

/// Reply to `membership.get`: the caller's own row, including its
/// wrapped vault key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipResponse {
    /// The caller's membership.
    pub membership: VaultMembership,
    /// Newest HLC the server accepted from the caller in this vault.
    #[serde(default)]
    pub author_head: Option<HlcTimestamp>,
}

/// `membership.remove`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveMemberRequest {
    /// Vault id.
    pub vault_id: VaultId,
    /// Member to remove.
    pub target: PubkeyHash,
}

/// Reply to `membership.remove`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveMemberResponse {
    /// Remaining members able to receive a new key.
    pub remaining: Vec<RekeyTarget>,
}

/// `membership.rekey`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyRequest {
    /// Vault id.
    pub vault_id: VaultId,
    /// New vault key wrapped per remaining member.
    pub member_keys: Vec<MemberKey>,
}

/// Reply to `membership.rekey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyResponse {
    /// The vault's new key epoch.
    pub key_epoch: u32,
}

/// `invite.create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInviteRequest {
    /// Vault id.
    pub vault_id: VaultId,
    /// Public half of the invite key.
    pub invite_pubkey: DevicePublicKey,
    /// Vault key wrapped for the invite key.
    pub encrypted_vault_key: Vec<u8>,
    /// Role granted on acceptance.
    pub role: Role,
    /// Requested lifetime in milliseconds.
    pub ttl_ms: u64,
}

/// Reply to `invite.create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInviteResponse {
    /// The stored invite.
    pub invite: VaultInvite,
}

/// `invite.accept`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptInviteRequest {
    /// Invite id.
    pub invite_id: InviteId,
    /// Signature by the invite key over the acceptance payload.
    pub invite_signature: Vec<u8>,
    /// Vault key re-wrapped for the accepting device.
    pub encrypted_vault_key: Vec<u8>,
    /// Accepting device's key-encapsulation public key.
    pub enc_public_key: Option<Vec<u8>>,
}

/// Reply to `invite.accept`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptInviteResponse {
    /// The created membership.
    pub membership: VaultMembership,
}

/// Reply to `invite.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListInvitesResponse {
    /// Pending, unexpired invites.
    pub invites: Vec<VaultInvite>,
}

/// `sync.append`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendUpdateRequest {
    /// Vault id.
    pub vault_id: VaultId,
    /// Snapshot version the update is based on.
    pub base_snapshot_version: u64,
    /// Author HLC timestamp.
    pub hlc_timestamp: HlcTimestamp,
    /// Key epoch that encrypted the payload.
    pub key_epoch: u32,
    /// Encrypted delta.
    pub encrypted_data: Vec<u8>,
}

/// Reply to `sync.append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendUpdateResponse {
    /// Assigned insertion id.
    pub update_id: u64,
    /// Position in the total order.
    pub position: UpdatePosition,
}

/// `sync.fetchSince`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSinceRequest {
    /// Vault id.
    pub vault_id: VaultId,
    /// Highest snapshot version the caller can start from.
    pub since_version: u64,
    /// Last position already received (pagination).
    pub after: Option<UpdatePosition>,
    /// Maximum number of updates to return.
    pub limit: Option<u32>,
}

impl FetchSinceRequest {
    /// Requests everything after the latest snapshot at or before `since_version`.
    #[must_use]
    pub fn new(vault_id: VaultId, since_version: u64) -> Self {
        Self {
            vault_id,
            since_version,
            after: None,
            limit: None,
        }
    }

    /// Continues after a position.
    #[must_use]
    pub fn after(mut self, position: UpdatePosition) -> Self {
        self.after = Some(position);
        self
    }

    /// Caps the page size.
    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Reply to `sync.fetchSince`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSinceResponse {
    /// Snapshot to start replay from.
    pub snapshot: VaultSnapshot,
    /// Updates after the snapshot, in total order.
    pub updates: Vec<VaultUpdate>,
    /// True when more updates follow the last one returned.
    pub has_more: bool,
}

/// `user.put`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutUserDataRequest {
    /// Encrypted keypair and settings.
    pub encrypted_data: Vec<u8>,
    /// Device fingerprint.
    pub device_fingerprint: String,
}

/// Reply to `user.get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDataResponse {
    /// Stored row.
    pub user_data: UserData,
}
