//! Sync log: authenticated append and read over snapshots and updates.

use crate::access::require_member;
use crate::auth::AuthContext;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use ledgervault_protocol::{
    AppendUpdateRequest, AppendUpdateResponse, FetchSinceRequest, FetchSinceResponse, MemberInfo,
    VaultId, VaultSnapshot, VaultUpdate,
};
use ledgervault_store::{NewUpdate, VaultStore};
use std::sync::Arc;
use tracing::{debug, info};

/// Produces a merged encrypted state from a snapshot and the updates that
/// follow it. Implemented by a process holding the vault key; the server
/// cannot read either side.
pub trait SnapshotBuilder {
    /// Returns the encrypted state after applying `updates` (in total
    /// order) to `base`.
    fn build(&self, base: &VaultSnapshot, updates: &[VaultUpdate]) -> ServerResult<Vec<u8>>;
}

impl<F> SnapshotBuilder for F
where
    F: Fn(&VaultSnapshot, &[VaultUpdate]) -> ServerResult<Vec<u8>>,
{
    fn build(&self, base: &VaultSnapshot, updates: &[VaultUpdate]) -> ServerResult<Vec<u8>> {
        self(base, updates)
    }
}

/// Result of a compaction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// The new snapshot.
    pub snapshot: VaultSnapshot,
    /// Updates folded into it.
    pub folded: usize,
    /// Updates pruned afterwards.
    pub pruned: usize,
}

/// Append/read operations on the vault log.
#[derive(Debug, Clone)]
pub struct SyncLog {
    store: Arc<VaultStore>,
    config: Arc<ServerConfig>,
}

impl SyncLog {
    /// Creates the sync log over a store.
    pub fn new(store: Arc<VaultStore>, config: Arc<ServerConfig>) -> Self {
        Self { store, config }
    }

    /// Lists the members of a vault the caller belongs to.
    pub fn list_members(&self, ctx: &AuthContext, vault_id: &VaultId) -> ServerResult<Vec<MemberInfo>> {
        require_member(&self.store, ctx, vault_id)?;
        Ok(self
            .store
            .members(vault_id)?
            .iter()
            .map(MemberInfo::from)
            .collect())
    }

    /// Appends an update authored by the caller.
    pub fn append_update(
        &self,
        ctx: &AuthContext,
        request: AppendUpdateRequest,
    ) -> ServerResult<AppendUpdateResponse> {
        require_member(&self.store, ctx, &request.vault_id)?;
        if request.encrypted_data.len() > self.config.max_update_bytes {
            return Err(ServerError::BadRequest(format!(
                "update of {} bytes exceeds the {} byte limit",
                request.encrypted_data.len(),
                self.config.max_update_bytes
            )));
        }

        let update = self.store.append_update(NewUpdate {
            vault_id: request.vault_id,
            author: ctx.pubkey_hash,
            base_snapshot_version: request.base_snapshot_version,
            hlc_timestamp: request.hlc_timestamp,
            key_epoch: request.key_epoch,
            encrypted_data: request.encrypted_data,
        })?;
        Ok(AppendUpdateResponse {
            update_id: update.id,
            position: update.position(),
        })
    }

    /// Returns a snapshot and the updates after it, one page at a time.
    ///
    /// The snapshot is the newest one at or below `since_version`. If the
    /// updates following it have been pruned, the oldest snapshot that
    /// covers the prune watermark is returned instead.
    pub fn fetch_since(
        &self,
        ctx: &AuthContext,
        request: &FetchSinceRequest,
    ) -> ServerResult<FetchSinceResponse> {
        let vault_id = &request.vault_id;
        require_member(&self.store, ctx, vault_id)?;
        let vault = self.store.vault(vault_id).ok_or_else(ServerError::not_found_vault)?;

        let mut snapshot = self
            .store
            .snapshot_at_or_before(vault_id, request.since_version)
            .ok_or_else(ServerError::not_found_vault)?;
        if snapshot.covers_through < vault.pruned_through {
            snapshot = self
                .store
                .snapshot_covering(vault_id, vault.pruned_through)
                .ok_or_else(|| {
                    ServerError::Internal(format!(
                        "no snapshot covers pruned updates through {}",
                        vault.pruned_through
                    ))
                })?;
        }

        let limit = request
            .limit
            .unwrap_or(self.config.max_fetch_batch)
            .clamp(1, self.config.max_fetch_batch.max(1));
        let page = self.store.updates_after(
            vault_id,
            snapshot.covers_through,
            request.after,
            limit as usize,
        )?;
        debug!(
            vault_id = %vault_id,
            version = snapshot.version,
            updates = page.updates.len(),
            has_more = page.has_more,
            "fetch served"
        );
        Ok(FetchSinceResponse {
            snapshot,
            updates: page.updates,
            has_more: page.has_more,
        })
    }

    /// Returns true once enough updates follow the latest snapshot.
    pub fn needs_compaction(&self, vault_id: &VaultId) -> ServerResult<bool> {
        Ok(self.store.pending_update_count(vault_id)? >= self.config.compaction_threshold.max(1))
    }

    /// Folds every update after the latest snapshot into a new snapshot.
    ///
    /// Runs out of band and takes no caller identity. Returns `None` when
    /// there is nothing to fold. Updates appended while the builder runs
    /// have higher ids than the new snapshot covers and stay in the log.
    pub fn compact(
        &self,
        vault_id: &VaultId,
        builder: &dyn SnapshotBuilder,
    ) -> ServerResult<Option<CompactionOutcome>> {
        let base = self
            .store
            .latest_snapshot(vault_id)
            .ok_or_else(ServerError::not_found_vault)?;
        let updates = self
            .store
            .updates_after(vault_id, base.covers_through, None, usize::MAX)?
            .updates;
        let (Some(covers_through), Some(hlc)) = (
            updates.iter().map(|u| u.id).max(),
            updates.iter().map(|u| u.hlc_timestamp).max(),
        ) else {
            return Ok(None);
        };

        let encrypted = builder.build(&base, &updates)?;
        let snapshot = self
            .store
            .insert_snapshot(vault_id, hlc, covers_through, encrypted)?;

        let pruned = if self.config.prune_after_compaction {
            self.store.prune_updates(vault_id, covers_through)?
        } else {
            0
        };
        info!(
            vault_id = %vault_id,
            version = snapshot.version,
            folded = updates.len(),
            pruned,
            "vault compacted"
        );
        Ok(Some(CompactionOutcome {
            snapshot,
            folded: updates.len(),
            pruned,
        }))
    }
}
