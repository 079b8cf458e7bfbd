//! The vault store handle.

use crate::backend::{FileBackend, InMemoryBackend, StorageBackend};
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::journal::{Journal, JournalStats};
use crate::record::JournalRecord;
use crate::tables::{Tables, VaultRows};
use ledgervault_protocol::{
    Clock, HlcTimestamp, InviteId, MemberKey, PubkeyHash, Role, UpdatePosition, UserData, Vault,
    VaultId, VaultInvite, VaultMembership, VaultSnapshot, VaultUpdate,
};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Receives store commits. Called after the write lock is released.
pub trait CommitListener: Send + Sync {
    /// An update was appended.
    fn update_appended(&self, update: &VaultUpdate);

    /// A membership was deleted (removal or leave).
    fn member_removed(&self, _vault_id: &VaultId, _pubkey_hash: &PubkeyHash) {}

    /// A vault and its rows were deleted.
    fn vault_deleted(&self, _vault_id: &VaultId) {}
}

/// Input to [`VaultStore::create_vault`].
#[derive(Debug, Clone)]
pub struct NewVault {
    /// Vault id chosen by the client.
    pub id: VaultId,
    /// Owner identity.
    pub owner: PubkeyHash,
    /// Vault key wrapped for the owner.
    pub encrypted_vault_key: Vec<u8>,
    /// Owner's key-encapsulation public key.
    pub enc_public_key: Option<Vec<u8>>,
    /// Encrypted empty state for snapshot version 0.
    pub genesis_data: Vec<u8>,
    /// HLC of the genesis snapshot.
    pub genesis_hlc: HlcTimestamp,
}

/// Input to [`VaultStore::append_update`].
#[derive(Debug, Clone)]
pub struct NewUpdate {
    /// Vault id.
    pub vault_id: VaultId,
    /// Author identity.
    pub author: PubkeyHash,
    /// Snapshot the update is based on.
    pub base_snapshot_version: u64,
    /// Author HLC timestamp.
    pub hlc_timestamp: HlcTimestamp,
    /// Key epoch of the payload.
    pub key_epoch: u32,
    /// Encrypted delta.
    pub encrypted_data: Vec<u8>,
}

/// A page of updates returned by [`VaultStore::updates_after`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePage {
    /// Updates in total order.
    pub updates: Vec<VaultUpdate>,
    /// True when further updates follow the page.
    pub has_more: bool,
}

/// Row counts for one vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSummary {
    /// Vault row.
    pub vault: Vault,
    /// Current members.
    pub members: usize,
    /// Stored snapshots.
    pub snapshots: usize,
    /// Latest snapshot version.
    pub latest_version: u64,
    /// Stored (unpruned) updates.
    pub updates: usize,
    /// Pending invites.
    pub invites: usize,
}

/// Whole-store counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Per-vault counts.
    pub vaults: Vec<VaultSummary>,
    /// User data rows.
    pub user_data: usize,
    /// Last assigned update id.
    pub last_update_id: u64,
    /// Journal counters.
    pub journal: JournalStats,
}

struct Inner {
    tables: Tables,
    journal: Journal,
}

/// The system of record for vaults, memberships, invites, snapshots,
/// updates and user data.
///
/// Every mutation is validated against the tables, appended to the journal
/// as a single record and then applied, all under one write lock. A failed
/// journal write leaves the tables untouched.
pub struct VaultStore {
    inner: RwLock<Inner>,
    listener: RwLock<Option<Arc<dyn CommitListener>>>,
    clock: Arc<dyn Clock>,
    dir: Option<StoreDir>,
}

impl VaultStore {
    /// Opens a volatile store.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> StoreResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), &StoreConfig::default(), clock)
    }

    /// Opens a store over an arbitrary backend, replaying its journal.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let (journal, records) = Journal::open(backend, config.sync_on_write)?;
        let mut tables = Tables::default();
        for record in &records {
            tables.apply(record)?;
        }
        debug!(
            records = records.len(),
            vaults = tables.vaults.len(),
            "store replayed"
        );
        Ok(Self {
            inner: RwLock::new(Inner { tables, journal }),
            listener: RwLock::new(None),
            clock,
            dir: None,
        })
    }

    /// Opens (or creates) a file-backed store in `path`, taking an
    /// exclusive lock on the directory.
    pub fn open(path: &Path, config: &StoreConfig, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let backend = FileBackend::open(&dir.journal_path())?;
        let mut store = Self::open_with_backend(Box::new(backend), config, clock)?;
        info!(path = %dir.path().display(), "store opened");
        store.dir = Some(dir);
        Ok(store)
    }

    /// Installs the commit listener, replacing any previous one.
    pub fn set_commit_listener(&self, listener: Arc<dyn CommitListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Returns the store's clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Directory of a file-backed store.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    fn commit(inner: &mut Inner, record: JournalRecord) -> StoreResult<()> {
        inner.journal.append(&record)?;
        inner.tables.apply(&record)?;
        debug!(kind = record.kind(), "record committed");
        Ok(())
    }

    fn notify(&self, f: impl FnOnce(&dyn CommitListener)) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            f(listener.as_ref());
        }
    }

    // ------------------------------------------------------------------
    // Vaults
    // ------------------------------------------------------------------

    /// Creates a vault, its owner membership and its genesis snapshot in
    /// one record.
    pub fn create_vault(&self, new: NewVault) -> StoreResult<Vault> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.write();
        if inner.tables.vaults.contains_key(&new.id) {
            return Err(StoreError::AlreadyExists(format!("vault {}", new.id)));
        }

        let vault = Vault {
            id: new.id,
            key_epoch: 0,
            pruned_through: 0,
            created_at: now,
        };
        let owner = VaultMembership {
            vault_id: new.id,
            pubkey_hash: new.owner,
            role: Role::Owner,
            encrypted_vault_key: Some(new.encrypted_vault_key),
            enc_public_key: new.enc_public_key,
            key_epoch: 0,
            joined_at: now,
        };
        let genesis = VaultSnapshot {
            id: inner.tables.last_snapshot_id + 1,
            vault_id: new.id,
            version: 0,
            hlc_timestamp: new.genesis_hlc,
            covers_through: inner.tables.last_update_id,
            encrypted_data: new.genesis_data,
            created_at: now,
        };

        Self::commit(
            &mut inner,
            JournalRecord::CreateVault {
                vault: vault.clone(),
                owner,
                genesis,
            },
        )?;
        info!(vault_id = %vault.id, owner = %new.owner.short(), "vault created");
        Ok(vault)
    }

    /// Returns a vault.
    #[must_use]
    pub fn vault(&self, vault_id: &VaultId) -> Option<Vault> {
        self.inner
            .read()
            .tables
            .vaults
            .get(vault_id)
            .map(|rows| rows.vault.clone())
    }

    /// Deletes a vault with its memberships, invites, snapshots and updates.
    pub fn delete_vault(&self, vault_id: &VaultId) -> StoreResult<()> {
        {
            let mut inner = self.inner.write();
            inner.tables.vault(vault_id)?;
            Self::commit(
                &mut inner,
                JournalRecord::DeleteVault {
                    vault_id: *vault_id,
                },
            )?;
        }
        info!(vault_id = %vault_id, "vault deleted");
        self.notify(|l| l.vault_deleted(vault_id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Memberships
    // ------------------------------------------------------------------

    /// Returns one membership.
    #[must_use]
    pub fn membership(&self, vault_id: &VaultId, pubkey_hash: &PubkeyHash) -> Option<VaultMembership> {
        self.inner
            .read()
            .tables
            .vaults
            .get(vault_id)
            .and_then(|rows| rows.members.get(pubkey_hash).cloned())
    }

    /// Returns every membership of a vault, ordered by pubkey hash.
    pub fn members(&self, vault_id: &VaultId) -> StoreResult<Vec<VaultMembership>> {
        let inner = self.inner.read();
        Ok(inner.tables.vault(vault_id)?.members.values().cloned().collect())
    }

    /// Inserts a membership.
    pub fn insert_membership(&self, membership: VaultMembership) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let rows = inner.tables.vault(&membership.vault_id)?;
        if rows.members.contains_key(&membership.pubkey_hash) {
            return Err(StoreError::AlreadyExists(format!(
                "membership {} in vault {}",
                membership.pubkey_hash.short(),
                membership.vault_id
            )));
        }
        Self::commit(&mut inner, JournalRecord::InsertMembership { membership })
    }

    /// Deletes a membership and returns the removed row.
    pub fn delete_membership(
        &self,
        vault_id: &VaultId,
        pubkey_hash: &PubkeyHash,
    ) -> StoreResult<VaultMembership> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner
                .tables
                .vault(vault_id)?
                .members
                .get(pubkey_hash)
                .cloned()
                .ok_or_else(|| {
                    StoreError::not_found(format!("membership {} in vault {vault_id}", pubkey_hash.short()))
                })?;
            Self::commit(
                &mut inner,
                JournalRecord::DeleteMembership {
                    vault_id: *vault_id,
                    pubkey_hash: *pubkey_hash,
                },
            )?;
            removed
        };
        info!(vault_id = %vault_id, member = %pubkey_hash.short(), "membership deleted");
        self.notify(|l| l.member_removed(vault_id, pubkey_hash));
        Ok(removed)
    }

    /// Rotates the vault key in one record.
    ///
    /// `member_keys` must be non-empty, name each member at most once, name
    /// only current members and cover every member that has a
    /// key-encapsulation public key. Members left out lose their wrapped
    /// key. Pending invites are dropped because they wrap the old key.
    /// Returns the new key epoch.
    pub fn rotate_keys(&self, vault_id: &VaultId, member_keys: Vec<MemberKey>) -> StoreResult<u32> {
        let mut inner = self.inner.write();
        let rows = inner.tables.vault(vault_id)?;

        if member_keys.is_empty() {
            return Err(StoreError::constraint("rekey requires at least one member key"));
        }
        let mut seen = BTreeSet::new();
        for key in &member_keys {
            if !seen.insert(key.pubkey_hash) {
                return Err(StoreError::constraint(format!(
                    "duplicate key for member {}",
                    key.pubkey_hash.short()
                )));
            }
            if !rows.members.contains_key(&key.pubkey_hash) {
                return Err(StoreError::constraint(format!(
                    "{} is not a member of vault {vault_id}",
                    key.pubkey_hash.short()
                )));
            }
            if key.encrypted_vault_key.is_empty() {
                return Err(StoreError::constraint(format!(
                    "empty wrapped key for member {}",
                    key.pubkey_hash.short()
                )));
            }
        }
        if let Some(missing) = rows
            .members
            .values()
            .find(|m| m.enc_public_key.is_some() && !seen.contains(&m.pubkey_hash))
        {
            return Err(StoreError::constraint(format!(
                "rekey does not cover member {}",
                missing.pubkey_hash.short()
            )));
        }

        let key_epoch = rows
            .vault
            .key_epoch
            .checked_add(1)
            .ok_or_else(|| StoreError::constraint("key epoch exhausted"))?;
        let covered = member_keys.len();
        Self::commit(
            &mut inner,
            JournalRecord::RotateKeys {
                vault_id: *vault_id,
                key_epoch,
                member_keys,
            },
        )?;
        info!(vault_id = %vault_id, key_epoch, members = covered, "vault key rotated");
        Ok(key_epoch)
    }

    // ------------------------------------------------------------------
    // Invites
    // ------------------------------------------------------------------

    /// Stores an invite.
    pub fn insert_invite(&self, invite: VaultInvite) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.tables.vault(&invite.vault_id)?;
        if inner.tables.invites.contains_key(&invite.id) {
            return Err(StoreError::AlreadyExists(format!("invite {}", invite.id)));
        }
        Self::commit(&mut inner, JournalRecord::InsertInvite { invite })
    }

    /// Returns an invite, expired or not.
    #[must_use]
    pub fn invite(&self, invite_id: &InviteId) -> Option<VaultInvite> {
        self.inner.read().tables.invites.get(invite_id).cloned()
    }

    /// Returns a vault's unexpired invites, oldest first.
    #[must_use]
    pub fn invites(&self, vault_id: &VaultId, now: u64) -> Vec<VaultInvite> {
        let inner = self.inner.read();
        let mut invites: Vec<_> = inner
            .tables
            .invites
            .values()
            .filter(|i| i.vault_id == *vault_id && !i.is_expired(now))
            .cloned()
            .collect();
        invites.sort_by_key(|i| (i.created_at, i.id));
        invites
    }

    /// Consumes an unexpired invite, turning it into a membership for
    /// `acceptor` in one record.
    pub fn consume_invite(
        &self,
        invite_id: &InviteId,
        acceptor: PubkeyHash,
        encrypted_vault_key: Vec<u8>,
        enc_public_key: Option<Vec<u8>>,
    ) -> StoreResult<VaultMembership> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.write();
        let invite = inner
            .tables
            .invites
            .get(invite_id)
            .filter(|i| !i.is_expired(now))
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("invite {invite_id}")))?;
        let rows = inner.tables.vault(&invite.vault_id)?;
        if rows.members.contains_key(&acceptor) {
            return Err(StoreError::AlreadyExists(format!(
                "membership {} in vault {}",
                acceptor.short(),
                invite.vault_id
            )));
        }

        let membership = VaultMembership {
            vault_id: invite.vault_id,
            pubkey_hash: acceptor,
            role: invite.role,
            encrypted_vault_key: Some(encrypted_vault_key),
            enc_public_key,
            key_epoch: rows.vault.key_epoch,
            joined_at: now,
        };
        Self::commit(
            &mut inner,
            JournalRecord::ConsumeInvite {
                invite_id: *invite_id,
                membership: membership.clone(),
            },
        )?;
        info!(vault_id = %invite.vault_id, member = %acceptor.short(), role = %invite.role, "invite consumed");
        Ok(membership)
    }

    /// Deletes every invite expired at `now`. Returns how many were removed.
    pub fn purge_expired_invites(&self, now: u64) -> StoreResult<usize> {
        let mut inner = self.inner.write();
        let invite_ids: Vec<InviteId> = inner
            .tables
            .invites
            .values()
            .filter(|i| i.is_expired(now))
            .map(|i| i.id)
            .collect();
        let count = invite_ids.len();
        if count > 0 {
            Self::commit(&mut inner, JournalRecord::DeleteInvites { invite_ids })?;
            info!(count, "expired invites purged");
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Stores the next snapshot version of a vault.
    ///
    /// `covers_through` may not move backwards and may not exceed the last
    /// assigned update id.
    pub fn insert_snapshot(
        &self,
        vault_id: &VaultId,
        hlc_timestamp: HlcTimestamp,
        covers_through: u64,
        encrypted_data: Vec<u8>,
    ) -> StoreResult<VaultSnapshot> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.write();
        let last_update_id = inner.tables.last_update_id;
        let rows = inner.tables.vault(vault_id)?;
        let latest = rows
            .latest_snapshot()
            .ok_or_else(|| StoreError::Corrupted(format!("vault {vault_id} has no snapshot")))?;
        if covers_through < latest.covers_through || covers_through > last_update_id {
            return Err(StoreError::constraint(format!(
                "snapshot must cover {}..={last_update_id}, got {covers_through}",
                latest.covers_through
            )));
        }

        let snapshot = VaultSnapshot {
            id: inner.tables.last_snapshot_id + 1,
            vault_id: *vault_id,
            version: latest.version + 1,
            hlc_timestamp,
            covers_through,
            encrypted_data,
            created_at: now,
        };
        Self::commit(
            &mut inner,
            JournalRecord::InsertSnapshot {
                snapshot: snapshot.clone(),
            },
        )?;
        info!(vault_id = %vault_id, version = snapshot.version, covers_through, "snapshot stored");
        Ok(snapshot)
    }

    /// Returns the newest snapshot.
    #[must_use]
    pub fn latest_snapshot(&self, vault_id: &VaultId) -> Option<VaultSnapshot> {
        self.with_rows(vault_id, |rows| rows.latest_snapshot().cloned())
    }

    /// Returns the newest snapshot with `version <= version`.
    #[must_use]
    pub fn snapshot_at_or_before(&self, vault_id: &VaultId, version: u64) -> Option<VaultSnapshot> {
        self.with_rows(vault_id, |rows| {
            rows.snapshots
                .range(..=version)
                .next_back()
                .map(|(_, s)| s.clone())
        })
    }

    /// Returns the oldest snapshot with `covers_through >= through`.
    #[must_use]
    pub fn snapshot_covering(&self, vault_id: &VaultId, through: u64) -> Option<VaultSnapshot> {
        self.with_rows(vault_id, |rows| {
            rows.snapshots
                .values()
                .find(|s| s.covers_through >= through)
                .cloned()
        })
    }

    /// Returns true if the vault has a snapshot with this version.
    #[must_use]
    pub fn snapshot_exists(&self, vault_id: &VaultId, version: u64) -> bool {
        self.with_rows(vault_id, |rows| Some(rows.snapshots.contains_key(&version)))
            .unwrap_or(false)
    }

    fn with_rows<T>(&self, vault_id: &VaultId, f: impl FnOnce(&VaultRows) -> Option<T>) -> Option<T> {
        self.inner.read().tables.vaults.get(vault_id).and_then(f)
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Appends an update.
    ///
    /// Rejected with [`StoreError::Constraint`] when the base snapshot does
    /// not exist, the key epoch is not the vault's current one, or the HLC
    /// does not follow the author's previous update in this vault. The
    /// author must be a current member.
    pub fn append_update(&self, new: NewUpdate) -> StoreResult<VaultUpdate> {
        let now = self.clock.now_millis();
        let update = {
            let mut inner = self.inner.write();
            let rows = inner.tables.vault(&new.vault_id)?;
            if !rows.members.contains_key(&new.author) {
                return Err(StoreError::not_found(format!(
                    "membership {} in vault {}",
                    new.author.short(),
                    new.vault_id
                )));
            }
            if !rows.snapshots.contains_key(&new.base_snapshot_version) {
                return Err(StoreError::constraint(format!(
                    "base snapshot version {} does not exist",
                    new.base_snapshot_version
                )));
            }
            if new.key_epoch != rows.vault.key_epoch {
                return Err(StoreError::constraint(format!(
                    "key epoch {} is not the current epoch {}",
                    new.key_epoch, rows.vault.key_epoch
                )));
            }
            if let Some(head) = rows.author_heads.get(&new.author) {
                // A repeated timestamp is a replayed request.
                if new.hlc_timestamp <= *head {
                    return Err(StoreError::constraint(format!(
                        "hlc timestamp {} does not follow author's last update {head}",
                        new.hlc_timestamp
                    )));
                }
            }

            let update = VaultUpdate {
                id: inner.tables.last_update_id + 1,
                vault_id: new.vault_id,
                base_snapshot_version: new.base_snapshot_version,
                hlc_timestamp: new.hlc_timestamp,
                author_pubkey_hash: new.author,
                key_epoch: new.key_epoch,
                encrypted_data: new.encrypted_data,
                created_at: now,
            };
            Self::commit(
                &mut inner,
                JournalRecord::AppendUpdate {
                    update: update.clone(),
                },
            )?;
            update
        };
        debug!(
            vault_id = %update.vault_id,
            update_id = update.id,
            author = %update.author_pubkey_hash.short(),
            "update appended"
        );
        self.notify(|l| l.update_appended(&update));
        Ok(update)
    }

    /// Returns updates with `id > covers_through` and position after
    /// `after`, in total order, at most `limit` of them.
    pub fn updates_after(
        &self,
        vault_id: &VaultId,
        covers_through: u64,
        after: Option<UpdatePosition>,
        limit: usize,
    ) -> StoreResult<UpdatePage> {
        let inner = self.inner.read();
        let rows = inner.tables.vault(vault_id)?;
        let mut matching = rows
            .updates
            .iter()
            .filter(|(position, update)| {
                update.id > covers_through && after.map_or(true, |a| **position > a)
            })
            .map(|(_, update)| update);

        let updates: Vec<VaultUpdate> = matching.by_ref().take(limit).cloned().collect();
        let has_more = matching.next().is_some();
        Ok(UpdatePage { updates, has_more })
    }

    /// Newest HLC accepted from `author` in a vault. Survives pruning.
    pub fn author_head(&self, vault_id: &VaultId, author: &PubkeyHash) -> Option<HlcTimestamp> {
        self.inner
            .read()
            .tables
            .vaults
            .get(vault_id)
            .and_then(|rows| rows.author_heads.get(author).copied())
    }

    /// Counts updates not folded into the latest snapshot.
    pub fn pending_update_count(&self, vault_id: &VaultId) -> StoreResult<usize> {
        let inner = self.inner.read();
        let rows = inner.tables.vault(vault_id)?;
        let covered = rows.latest_snapshot().map_or(0, |s| s.covers_through);
        Ok(rows.updates.values().filter(|u| u.id > covered).count())
    }

    /// Drops updates with `id <= through`. `through` may not exceed the
    /// latest snapshot's coverage. Returns how many rows were dropped.
    pub fn prune_updates(&self, vault_id: &VaultId, through: u64) -> StoreResult<usize> {
        let mut inner = self.inner.write();
        let rows = inner.tables.vault(vault_id)?;
        let covered = rows.latest_snapshot().map_or(0, |s| s.covers_through);
        if through > covered {
            return Err(StoreError::constraint(format!(
                "cannot prune through {through}, latest snapshot covers {covered}"
            )));
        }
        let count = rows.updates.values().filter(|u| u.id <= through).count();
        if through <= rows.vault.pruned_through && count == 0 {
            return Ok(0);
        }
        Self::commit(
            &mut inner,
            JournalRecord::PruneUpdates {
                vault_id: *vault_id,
                through,
            },
        )?;
        info!(vault_id = %vault_id, through, count, "updates pruned");
        Ok(count)
    }

    // ------------------------------------------------------------------
    // User data
    // ------------------------------------------------------------------

    /// Upserts a device's user data.
    pub fn put_user_data(
        &self,
        pubkey_hash: PubkeyHash,
        encrypted_data: Vec<u8>,
        device_fingerprint: String,
    ) -> StoreResult<UserData> {
        let user_data = UserData {
            pubkey_hash,
            encrypted_data,
            device_fingerprint,
            updated_at: self.clock.now_millis(),
        };
        let mut inner = self.inner.write();
        Self::commit(
            &mut inner,
            JournalRecord::PutUserData {
                user_data: user_data.clone(),
            },
        )?;
        Ok(user_data)
    }

    /// Returns a device's user data.
    #[must_use]
    pub fn user_data(&self, pubkey_hash: &PubkeyHash) -> Option<UserData> {
        self.inner.read().tables.user_data.get(pubkey_hash).cloned()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Returns row and journal counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let tables = &inner.tables;
        let vaults = tables
            .vaults
            .values()
            .map(|rows| VaultSummary {
                vault: rows.vault.clone(),
                members: rows.members.len(),
                snapshots: rows.snapshots.len(),
                latest_version: rows.latest_snapshot().map_or(0, |s| s.version),
                updates: rows.updates.len(),
                invites: tables
                    .invites
                    .values()
                    .filter(|i| i.vault_id == rows.vault.id)
                    .count(),
            })
            .collect();
        StoreStats {
            vaults,
            user_data: tables.user_data.len(),
            last_update_id: tables.last_update_id,
            journal: inner.journal.stats().clone(),
        }
    }
}

impl std::fmt::Debug for VaultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("VaultStore")
            .field("path", &self.path())
            .field("vaults", &inner.tables.vaults.len())
            .field("journal", inner.journal.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgervault_protocol::{DeviceKeypair, DevicePublicKey, ManualClock};
    use parking_lot::Mutex;

    struct Fixture {
        store: VaultStore,
        clock: Arc<ManualClock>,
        vault: Vault,
        owner: PubkeyHash,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = VaultStore::open_in_memory(clock.clone()).unwrap();
        let owner = DeviceKeypair::generate().pubkey_hash();
        let vault = store
            .create_vault(NewVault {
                id: VaultId::new(),
                owner,
                encrypted_vault_key: vec![0xA0],
                enc_public_key: Some(vec![0xE0]),
                genesis_data: b"genesis".to_vec(),
                genesis_hlc: HlcTimestamp::new(10_000, 0, 1),
            })
            .unwrap();
        Fixture {
            store,
            clock,
            vault,
            owner,
        }
    }

    fn member(vault_id: VaultId, enc: bool) -> VaultMembership {
        VaultMembership {
            vault_id,
            pubkey_hash: DeviceKeypair::generate().pubkey_hash(),
            role: Role::Member,
            encrypted_vault_key: Some(vec![0xB0]),
            enc_public_key: enc.then(|| vec![0xE1]),
            key_epoch: 0,
            joined_at: 0,
        }
    }

    fn update(f: &Fixture, author: PubkeyHash, physical: u64) -> NewUpdate {
        NewUpdate {
            vault_id: f.vault.id,
            author,
            base_snapshot_version: 0,
            hlc_timestamp: HlcTimestamp::new(physical, 0, 1),
            key_epoch: 0,
            encrypted_data: physical.to_le_bytes().to_vec(),
        }
    }

    #[test]
    fn create_vault_writes_owner_and_genesis() {
        let f = fixture();
        let members = f.store.members(&f.vault.id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, Role::Owner);
        assert_eq!(members[0].pubkey_hash, f.owner);

        let genesis = f.store.latest_snapshot(&f.vault.id).unwrap();
        assert_eq!(genesis.version, 0);
        assert_eq!(genesis.encrypted_data, b"genesis");
        assert_eq!(f.vault.created_at, 10_000);
    }

    #[test]
    fn duplicate_vault_id_is_rejected() {
        let f = fixture();
        let result = f.store.create_vault(NewVault {
            id: f.vault.id,
            owner: f.owner,
            encrypted_vault_key: vec![1],
            enc_public_key: None,
            genesis_data: vec![],
            genesis_hlc: HlcTimestamp::ZERO,
        });
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let f = fixture();
        let a = f.store.append_update(update(&f, f.owner, 20_000)).unwrap();
        let b = f.store.append_update(update(&f, f.owner, 20_001)).unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.created_at, 10_000);
    }

    #[test]
    fn append_rejects_missing_base_snapshot() {
        let f = fixture();
        let mut new = update(&f, f.owner, 20_000);
        new.base_snapshot_version = 7;
        assert!(matches!(
            f.store.append_update(new),
            Err(StoreError::Constraint(_))
        ));
    }

    #[test]
    fn append_requires_increasing_hlc_per_author() {
        let f = fixture();
        let other = member(f.vault.id, true);
        f.store.insert_membership(other.clone()).unwrap();

        f.store.append_update(update(&f, f.owner, 30_000)).unwrap();
        assert!(matches!(
            f.store.append_update(update(&f, f.owner, 29_999)),
            Err(StoreError::Constraint(_))
        ));
        assert!(matches!(
            f.store.append_update(update(&f, f.owner, 30_000)),
            Err(StoreError::Constraint(_))
        ));
        f.store.append_update(update(&f, f.owner, 30_001)).unwrap();
        assert_eq!(
            f.store.author_head(&f.vault.id, &f.owner),
            Some(HlcTimestamp::new(30_001, 0, 1))
        );
        // Other authors keep their own head.
        f.store
            .append_update(update(&f, other.pubkey_hash, 1))
            .unwrap();
    }

    #[test]
    fn append_rejects_stale_key_epoch() {
        let f = fixture();
        f.store
            .rotate_keys(
                &f.vault.id,
                vec![MemberKey {
                    pubkey_hash: f.owner,
                    encrypted_vault_key: vec![0xA1],
                }],
            )
            .unwrap();
        assert!(matches!(
            f.store.append_update(update(&f, f.owner, 20_000)),
            Err(StoreError::Constraint(_))
        ));
        let mut fresh = update(&f, f.owner, 20_000);
        fresh.key_epoch = 1;
        assert_eq!(f.store.append_update(fresh).unwrap().key_epoch, 1);
    }

    #[test]
    fn append_requires_membership() {
        let f = fixture();
        let stranger = DeviceKeypair::generate().pubkey_hash();
        assert!(matches!(
            f.store.append_update(update(&f, stranger, 20_000)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn updates_after_pages_in_total_order() {
        let f = fixture();
        let other = member(f.vault.id, true);
        f.store.insert_membership(other.clone()).unwrap();

        let late = f.store.append_update(update(&f, f.owner, 50)).unwrap();
        let early = f
            .store
            .append_update(update(&f, other.pubkey_hash, 40))
            .unwrap();
        let tie = f
            .store
            .append_update(update(&f, other.pubkey_hash, 50))
            .unwrap();

        let page = f.store.updates_after(&f.vault.id, 0, None, 2).unwrap();
        let ids: Vec<_> = page.updates.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
        assert!(page.has_more);

        let rest = f
            .store
            .updates_after(&f.vault.id, 0, Some(late.position()), 10)
            .unwrap();
        assert_eq!(rest.updates.len(), 1);
        assert_eq!(rest.updates[0].id, tie.id);
        assert!(!rest.has_more);
    }

    #[test]
    fn rotate_keys_replaces_and_clears() {
        let f = fixture();
        let enrolled = member(f.vault.id, true);
        let legacy = member(f.vault.id, false);
        f.store.insert_membership(enrolled.clone()).unwrap();
        f.store.insert_membership(legacy.clone()).unwrap();

        let epoch = f
            .store
            .rotate_keys(
                &f.vault.id,
                vec![
                    MemberKey {
                        pubkey_hash: f.owner,
                        encrypted_vault_key: vec![0xA1],
                    },
                    MemberKey {
                        pubkey_hash: enrolled.pubkey_hash,
                        encrypted_vault_key: vec![0xB1],
                    },
                ],
            )
            .unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(f.store.vault(&f.vault.id).unwrap().key_epoch, 1);

        let enrolled_row = f.store.membership(&f.vault.id, &enrolled.pubkey_hash).unwrap();
        assert_eq!(enrolled_row.encrypted_vault_key, Some(vec![0xB1]));
        assert_eq!(enrolled_row.key_epoch, 1);

        let legacy_row = f.store.membership(&f.vault.id, &legacy.pubkey_hash).unwrap();
        assert_eq!(legacy_row.encrypted_vault_key, None);
        assert_eq!(legacy_row.key_epoch, 0);
    }

    #[test]
    fn rotate_keys_validates_coverage() {
        let f = fixture();
        let enrolled = member(f.vault.id, true);
        f.store.insert_membership(enrolled.clone()).unwrap();
        let owner_key = MemberKey {
            pubkey_hash: f.owner,
            encrypted_vault_key: vec![0xA1],
        };

        let cases = vec![
            vec![],
            vec![owner_key.clone()],
            vec![owner_key.clone(), owner_key.clone()],
            vec![
                owner_key.clone(),
                MemberKey {
                    pubkey_hash: DeviceKeypair::generate().pubkey_hash(),
                    encrypted_vault_key: vec![1],
                },
            ],
        ];
        for keys in cases {
            assert!(matches!(
                f.store.rotate_keys(&f.vault.id, keys),
                Err(StoreError::Constraint(_))
            ));
        }
        assert_eq!(f.store.vault(&f.vault.id).unwrap().key_epoch, 0);
    }

    fn invite(f: &Fixture, expires_at: u64) -> VaultInvite {
        let key: DevicePublicKey = DeviceKeypair::generate().public_key();
        VaultInvite {
            id: InviteId::new(),
            vault_id: f.vault.id,
            invite_pubkey: key,
            encrypted_vault_key: vec![0xC0],
            role: Role::Member,
            created_by: f.owner,
            created_at: f.clock.now_millis(),
            expires_at,
        }
    }

    #[test]
    fn consume_invite_is_single_use() {
        let f = fixture();
        let inv = invite(&f, 20_000);
        f.store.insert_invite(inv.clone()).unwrap();
        let acceptor = DeviceKeypair::generate().pubkey_hash();

        let membership = f
            .store
            .consume_invite(&inv.id, acceptor, vec![0xD0], Some(vec![0xE2]))
            .unwrap();
        assert_eq!(membership.role, Role::Member);
        assert!(f.store.invite(&inv.id).is_none());
        assert!(matches!(
            f.store.consume_invite(&inv.id, acceptor, vec![0xD0], None),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn expired_invites_are_hidden_and_purged() {
        let f = fixture();
        let live = invite(&f, 20_000);
        let stale = invite(&f, 15_000);
        f.store.insert_invite(live.clone()).unwrap();
        f.store.insert_invite(stale.clone()).unwrap();

        f.clock.set(15_000);
        assert_eq!(f.store.invites(&f.vault.id, 15_000), vec![live.clone()]);
        assert!(matches!(
            f.store
                .consume_invite(&stale.id, DeviceKeypair::generate().pubkey_hash(), vec![1], None),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(f.store.purge_expired_invites(15_000).unwrap(), 1);
        assert!(f.store.invite(&stale.id).is_none());
        assert!(f.store.invite(&live.id).is_some());
    }

    #[test]
    fn rotate_keys_drops_pending_invites() {
        let f = fixture();
        let inv = invite(&f, 99_000);
        f.store.insert_invite(inv.clone()).unwrap();
        f.store
            .rotate_keys(
                &f.vault.id,
                vec![MemberKey {
                    pubkey_hash: f.owner,
                    encrypted_vault_key: vec![0xA1],
                }],
            )
            .unwrap();
        assert!(f.store.invite(&inv.id).is_none());
    }

    #[test]
    fn snapshots_and_pruning() {
        let f = fixture();
        let a = f.store.append_update(update(&f, f.owner, 100)).unwrap();
        let b = f.store.append_update(update(&f, f.owner, 200)).unwrap();
        assert_eq!(f.store.pending_update_count(&f.vault.id).unwrap(), 2);

        // Cannot prune what no snapshot covers.
        assert!(f.store.prune_updates(&f.vault.id, a.id).is_err());

        let snap = f
            .store
            .insert_snapshot(&f.vault.id, a.hlc_timestamp, a.id, b"s1".to_vec())
            .unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(f.store.pending_update_count(&f.vault.id).unwrap(), 1);
        assert!(f.store.snapshot_exists(&f.vault.id, 0));
        assert_eq!(
            f.store.snapshot_at_or_before(&f.vault.id, 5).unwrap().version,
            1
        );

        assert_eq!(f.store.prune_updates(&f.vault.id, a.id).unwrap(), 1);
        assert_eq!(f.store.vault(&f.vault.id).unwrap().pruned_through, a.id);
        assert_eq!(
            f.store.snapshot_covering(&f.vault.id, a.id).unwrap().version,
            1
        );
        let page = f.store.updates_after(&f.vault.id, 0, None, 10).unwrap();
        assert_eq!(page.updates.len(), 1);
        assert_eq!(page.updates[0].id, b.id);

        // Coverage may not move backwards.
        assert!(matches!(
            f.store.insert_snapshot(&f.vault.id, a.hlc_timestamp, 0, vec![]),
            Err(StoreError::Constraint(_))
        ));
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CommitListener for Recorder {
        fn update_appended(&self, update: &VaultUpdate) {
            self.events.lock().push(format!("update:{}", update.id));
        }

        fn member_removed(&self, _vault_id: &VaultId, pubkey_hash: &PubkeyHash) {
            self.events.lock().push(format!("removed:{}", pubkey_hash.short()));
        }

        fn vault_deleted(&self, vault_id: &VaultId) {
            self.events.lock().push(format!("deleted:{vault_id}"));
        }
    }

    #[test]
    fn listener_sees_commits_only() {
        let f = fixture();
        let recorder = Arc::new(Recorder::default());
        f.store.set_commit_listener(recorder.clone());

        let other = member(f.vault.id, true);
        f.store.insert_membership(other.clone()).unwrap();
        let u = f.store.append_update(update(&f, f.owner, 100)).unwrap();
        let _ = f.store.append_update(update(&f, f.owner, 1));
        f.store
            .delete_membership(&f.vault.id, &other.pubkey_hash)
            .unwrap();
        f.store.delete_vault(&f.vault.id).unwrap();

        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                format!("update:{}", u.id),
                format!("removed:{}", other.pubkey_hash.short()),
                format!("deleted:{}", f.vault.id),
            ]
        );
    }

    #[test]
    fn delete_vault_cascades() {
        let f = fixture();
        let inv = invite(&f, 99_000);
        f.store.insert_invite(inv.clone()).unwrap();
        f.store.append_update(update(&f, f.owner, 100)).unwrap();

        f.store.delete_vault(&f.vault.id).unwrap();
        assert!(f.store.vault(&f.vault.id).is_none());
        assert!(f.store.membership(&f.vault.id, &f.owner).is_none());
        assert!(f.store.invite(&inv.id).is_none());
        assert!(f.store.latest_snapshot(&f.vault.id).is_none());
        assert!(matches!(
            f.store.delete_vault(&f.vault.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn user_data_upserts() {
        let f = fixture();
        let device = DeviceKeypair::generate().pubkey_hash();
        assert!(f.store.user_data(&device).is_none());

        f.store
            .put_user_data(device, vec![1], "laptop".into())
            .unwrap();
        f.clock.advance(5);
        f.store
            .put_user_data(device, vec![2], "laptop".into())
            .unwrap();

        let row = f.store.user_data(&device).unwrap();
        assert_eq!(row.encrypted_data, vec![2]);
        assert_eq!(row.updated_at, 10_005);
    }

    #[test]
    fn stats_count_rows() {
        let f = fixture();
        f.store.append_update(update(&f, f.owner, 100)).unwrap();
        let stats = f.store.stats();
        assert_eq!(stats.vaults.len(), 1);
        assert_eq!(stats.vaults[0].members, 1);
        assert_eq!(stats.vaults[0].updates, 1);
        assert_eq!(stats.journal.records, 2);
        assert_eq!(stats.journal.by_kind.get("append_update"), Some(&1));
    }
}
