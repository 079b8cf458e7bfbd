//! Journal records.
//!
//! Every store mutation is exactly one record. Multi-row changes (vault
//! creation, invite consumption, key rotation) are single records so they
//! are applied all-or-nothing on replay.

use ledgervault_protocol::{
    InviteId, MemberKey, PubkeyHash, UserData, Vault, VaultId, VaultInvite, VaultMembership,
    VaultSnapshot, VaultUpdate,
};
use serde::{Deserialize, Serialize};

/// One committed store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// Vault row, owner membership and genesis snapshot.
    CreateVault {
        /// New vault.
        vault: Vault,
        /// Owner membership.
        owner: VaultMembership,
        /// Snapshot version 0.
        genesis: VaultSnapshot,
    },
    /// Vault and every dependent row.
    DeleteVault {
        /// Vault id.
        vault_id: VaultId,
    },
    /// New membership.
    InsertMembership {
        /// Membership row.
        membership: VaultMembership,
    },
    /// Membership removal.
    DeleteMembership {
        /// Vault id.
        vault_id: VaultId,
        /// Removed member.
        pubkey_hash: PubkeyHash,
    },
    /// Key rotation: epoch bump plus every member's wrapped key.
    RotateKeys {
        /// Vault id.
        vault_id: VaultId,
        /// Epoch after rotation.
        key_epoch: u32,
        /// Wrapped keys per member. Members not listed lose their key.
        member_keys: Vec<MemberKey>,
    },
    /// New invite.
    InsertInvite {
        /// Invite row.
        invite: VaultInvite,
    },
    /// Invite deletion plus the membership it turned into.
    ConsumeInvite {
        /// Consumed invite.
        invite_id: InviteId,
        /// Created membership.
        membership: VaultMembership,
    },
    /// Garbage-collected invites.
    DeleteInvites {
        /// Removed invite ids.
        invite_ids: Vec<InviteId>,
    },
    /// New snapshot.
    InsertSnapshot {
        /// Snapshot row.
        snapshot: VaultSnapshot,
    },
    /// New update.
    AppendUpdate {
        /// Update row.
        update: VaultUpdate,
    },
    /// Removal of updates already folded into a snapshot.
    PruneUpdates {
        /// Vault id.
        vault_id: VaultId,
        /// Updates with `id <= through` are dropped.
        through: u64,
    },
    /// Upsert of a device's user data.
    PutUserData {
        /// User data row.
        user_data: UserData,
    },
}

impl JournalRecord {
    /// Short name of the record kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateVault { .. } => "create_vault",
            Self::DeleteVault { .. } => "delete_vault",
            Self::InsertMembership { .. } => "insert_membership",
            Self::DeleteMembership { .. } => "delete_membership",
            Self::RotateKeys { .. } => "rotate_keys",
            Self::InsertInvite { .. } => "insert_invite",
            Self::ConsumeInvite { .. } => "consume_invite",
            Self::DeleteInvites { .. } => "delete_invites",
            Self::InsertSnapshot { .. } => "insert_snapshot",
            Self::AppendUpdate { .. } => "append_update",
            Self::PruneUpdates { .. } => "prune_updates",
            Self::PutUserData { .. } => "put_user_data",
        }
    }
}
