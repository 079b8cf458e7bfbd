//! In-memory tables rebuilt from the journal.

use crate::error::{StoreError, StoreResult};
use crate::record::JournalRecord;
use ledgervault_protocol::{
    HlcTimestamp, InviteId, PubkeyHash, UpdatePosition, UserData, Vault, VaultId, VaultInvite,
    VaultMembership, VaultSnapshot, VaultUpdate,
};
use std::collections::BTreeMap;

/// Rows belonging to one vault.
#[derive(Debug, Clone)]
pub(crate) struct VaultRows {
    pub(crate) vault: Vault,
    pub(crate) members: BTreeMap<PubkeyHash, VaultMembership>,
    /// Keyed by version.
    pub(crate) snapshots: BTreeMap<u64, VaultSnapshot>,
    /// Keyed by total-order position.
    pub(crate) updates: BTreeMap<UpdatePosition, VaultUpdate>,
    /// Newest HLC accepted per author. Survives pruning.
    pub(crate) author_heads: BTreeMap<PubkeyHash, HlcTimestamp>,
}

impl VaultRows {
    pub(crate) fn latest_snapshot(&self) -> Option<&VaultSnapshot> {
        self.snapshots.values().next_back()
    }
}

/// All tables plus id counters.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) vaults: BTreeMap<VaultId, VaultRows>,
    pub(crate) invites: BTreeMap<InviteId, VaultInvite>,
    pub(crate) user_data: BTreeMap<PubkeyHash, UserData>,
    pub(crate) last_update_id: u64,
    pub(crate) last_snapshot_id: u64,
}

impl Tables {
    pub(crate) fn vault(&self, vault_id: &VaultId) -> StoreResult<&VaultRows> {
        self.vaults
            .get(vault_id)
            .ok_or_else(|| StoreError::not_found(format!("vault {vault_id}")))
    }

    fn vault_mut(&mut self, vault_id: &VaultId) -> StoreResult<&mut VaultRows> {
        self.vaults
            .get_mut(vault_id)
            .ok_or_else(|| StoreError::Corrupted(format!("record references missing vault {vault_id}")))
    }

    /// Applies a committed record. Records are validated before they are
    /// journaled, so a failure here means the journal itself is inconsistent.
    pub(crate) fn apply(&mut self, record: &JournalRecord) -> StoreResult<()> {
        match record {
            JournalRecord::CreateVault {
                vault,
                owner,
                genesis,
            } => {
                self.last_snapshot_id = self.last_snapshot_id.max(genesis.id);
                self.vaults.insert(
                    vault.id,
                    VaultRows {
                        vault: vault.clone(),
                        members: BTreeMap::from([(owner.pubkey_hash, owner.clone())]),
                        snapshots: BTreeMap::from([(genesis.version, genesis.clone())]),
                        updates: BTreeMap::new(),
                        author_heads: BTreeMap::new(),
                    },
                );
            }
            JournalRecord::DeleteVault { vault_id } => {
                self.vaults.remove(vault_id);
                self.invites.retain(|_, invite| invite.vault_id != *vault_id);
            }
            JournalRecord::InsertMembership { membership } => {
                self.vault_mut(&membership.vault_id)?
                    .members
                    .insert(membership.pubkey_hash, membership.clone());
            }
            JournalRecord::DeleteMembership {
                vault_id,
                pubkey_hash,
            } => {
                self.vault_mut(vault_id)?.members.remove(pubkey_hash);
            }
            JournalRecord::RotateKeys {
                vault_id,
                key_epoch,
                member_keys,
            } => {
                let rows = self.vault_mut(vault_id)?;
                rows.vault.key_epoch = *key_epoch;
                for member in rows.members.values_mut() {
                    match member_keys.iter().find(|k| k.pubkey_hash == member.pubkey_hash) {
                        Some(key) => {
                            member.encrypted_vault_key = Some(key.encrypted_vault_key.clone());
                            member.key_epoch = *key_epoch;
                        }
                        None => member.encrypted_vault_key = None,
                    }
                }
                // Pending invites carry the retired key.
                self.invites.retain(|_, invite| invite.vault_id != *vault_id);
            }
            JournalRecord::InsertInvite { invite } => {
                self.invites.insert(invite.id, invite.clone());
            }
            JournalRecord::ConsumeInvite {
                invite_id,
                membership,
            } => {
                self.invites.remove(invite_id);
                self.vault_mut(&membership.vault_id)?
                    .members
                    .insert(membership.pubkey_hash, membership.clone());
            }
            JournalRecord::DeleteInvites { invite_ids } => {
                for id in invite_ids {
                    self.invites.remove(id);
                }
            }
            JournalRecord::InsertSnapshot { snapshot } => {
                self.last_snapshot_id = self.last_snapshot_id.max(snapshot.id);
                self.vault_mut(&snapshot.vault_id)?
                    .snapshots
                    .insert(snapshot.version, snapshot.clone());
            }
            JournalRecord::AppendUpdate { update } => {
                self.last_update_id = self.last_update_id.max(update.id);
                let rows = self.vault_mut(&update.vault_id)?;
                let head = rows
                    .author_heads
                    .entry(update.author_pubkey_hash)
                    .or_insert(update.hlc_timestamp);
                *head = (*head).max(update.hlc_timestamp);
                rows.updates.insert(update.position(), update.clone());
            }
            JournalRecord::PruneUpdates { vault_id, through } => {
                let rows = self.vault_mut(vault_id)?;
                rows.updates.retain(|_, update| update.id > *through);
                rows.vault.pruned_through = rows.vault.pruned_through.max(*through);
            }
            JournalRecord::PutUserData { user_data } => {
                self.user_data
                    .insert(user_data.pubkey_hash, user_data.clone());
            }
        }
        Ok(())
    }
}
