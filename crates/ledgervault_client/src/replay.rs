//! Local replay of a vault's snapshot and update log.
//!
//! A [`Replica`] decrypts the starting snapshot and hands each update's
//! plaintext delta to an [`UpdateApplier`]. Update ids are remembered, so
//! an update seen both through a fetch page and a realtime event is
//! applied once.

use crate::crypto::KeyRing;
use crate::error::{ClientError, ClientResult};
use ledgervault_protocol::{
    from_cbor, to_cbor, UpdateNotification, UpdatePosition, VaultId, VaultSnapshot,
    VaultUpdate,
};
use ledgervault_server::{ServerError, ServerResult, SnapshotBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use tracing::{debug, trace};

/// Applies decrypted vault contents.
///
/// The empty byte string is the empty state; genesis snapshots hold it.
/// Implementations must be commutative and idempotent per update so that
/// replicas converge regardless of delivery order.
pub trait UpdateApplier {
    /// Replaces the current state with a decrypted snapshot.
    fn load(&mut self, state: &[u8]) -> ClientResult<()>;

    /// Applies one decrypted delta.
    fn apply(&mut self, position: UpdatePosition, delta: &[u8]) -> ClientResult<()>;

    /// Serializes the current state for a new snapshot.
    fn snapshot(&self) -> ClientResult<Vec<u8>>;
}

/// A device-side copy of one vault.
#[derive(Debug)]
pub struct Replica<A> {
    vault_id: VaultId,
    applier: A,
    loaded: bool,
    snapshot_version: u64,
    covers_through: u64,
    applied: BTreeSet<u64>,
    last_position: Option<UpdatePosition>,
}

impl<A: UpdateApplier> Replica<A> {
    /// Creates an empty replica.
    pub fn new(vault_id: VaultId, applier: A) -> Self {
        Self {
            vault_id,
            applier,
            loaded: false,
            snapshot_version: 0,
            covers_through: 0,
            applied: BTreeSet::new(),
            last_position: None,
        }
    }

    /// Vault id.
    pub fn vault_id(&self) -> &VaultId {
        &self.vault_id
    }

    /// The applier and its state.
    pub fn applier(&self) -> &A {
        &self.applier
    }

    /// Version of the snapshot the replica started from.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    /// Highest update id folded into that snapshot.
    pub fn covers_through(&self) -> u64 {
        self.covers_through
    }

    /// Highest position applied since the snapshot.
    pub fn last_position(&self) -> Option<UpdatePosition> {
        self.last_position
    }

    /// Number of updates applied on top of the snapshot.
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Returns true once a snapshot has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Loads `snapshot` unless the replica already stands on it or on a
    /// newer one. Returns true if the state was replaced.
    pub fn load_snapshot(&mut self, snapshot: &VaultSnapshot, keys: &KeyRing) -> ClientResult<bool> {
        if self.loaded && snapshot.version <= self.snapshot_version {
            return Ok(false);
        }
        let state = if snapshot.encrypted_data.is_empty() {
            Vec::new()
        } else {
            keys.open(&self.vault_id, &snapshot.encrypted_data)?
        };
        self.applier.load(&state)?;
        self.loaded = true;
        self.snapshot_version = snapshot.version;
        self.covers_through = snapshot.covers_through;
        self.applied.clear();
        self.last_position = None;
        debug!(
            vault_id = %self.vault_id,
            version = snapshot.version,
            covers_through = snapshot.covers_through,
            "replica loaded snapshot"
        );
        Ok(true)
    }

    /// Applies a fetched update. Returns false for duplicates and for
    /// updates already folded into the snapshot.
    pub fn apply_update(&mut self, update: &VaultUpdate, keys: &KeyRing) -> ClientResult<bool> {
        self.apply_sealed(update.position(), &update.encrypted_data, keys)
    }

    /// Applies an update pushed on a realtime subscription.
    pub fn apply_notification(
        &mut self,
        notification: &UpdateNotification,
        keys: &KeyRing,
    ) -> ClientResult<bool> {
        let position = UpdatePosition::new(notification.hlc_timestamp, notification.id);
        self.apply_sealed(position, &notification.encrypted_data, keys)
    }

    fn apply_sealed(&mut self, position: UpdatePosition, sealed: &[u8], keys: &KeyRing) -> ClientResult<bool> {
        let id = position.update_id;
        if id <= self.covers_through || self.applied.contains(&id) {
            trace!(vault_id = %self.vault_id, update_id = id, "skipping known update");
            return Ok(false);
        }
        let delta = keys.open(&self.vault_id, sealed)?;
        self.applier.apply(position, &delta)?;
        self.applied.insert(id);
        self.last_position = Some(self.last_position.map_or(position, |last| last.max(position)));
        Ok(true)
    }

    /// Serializes the current state.
    pub fn state(&self) -> ClientResult<Vec<u8>> {
        self.applier.snapshot()
    }
}

/// One mutation inside a [`Delta`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Sets a key.
    Put {
        /// Entry key.
        key: String,
        /// New value.
        value: Vec<u8>,
    },
    /// Removes a key.
    Delete {
        /// Entry key.
        key: String,
    },
}

/// A batch of key/value mutations, the payload of one update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Mutations in order.
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a put.
    #[must_use]
    pub fn put(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.ops.push(DeltaOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Adds a delete.
    #[must_use]
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(DeltaOp::Delete { key: key.into() });
        self
    }

    /// CBOR encoding.
    pub fn encode(&self) -> ClientResult<Vec<u8>> {
        Ok(to_cbor(self)?)
    }

    /// Decodes a CBOR delta.
    pub fn decode(bytes: &[u8]) -> ClientResult<Self> {
        Ok(from_cbor(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    value: Option<Vec<u8>>,
    position: UpdatePosition,
}

/// Last-writer-wins key/value state.
///
/// Each key keeps the write with the highest log position; deletes leave a
/// tombstone so an older put arriving late cannot resurrect the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryApplier {
    entries: BTreeMap<String, Entry>,
}

impl MemoryApplier {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).and_then(|e| e.value.as_deref())
    }

    /// Live entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_deref().map(|v| (k.as_str(), v)))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns true if no key is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&mut self, key: String, value: Option<Vec<u8>>, position: UpdatePosition) {
        match self.entries.get(&key) {
            Some(existing) if existing.position >= position => {}
            _ => {
                self.entries.insert(key, Entry { value, position });
            }
        }
    }
}

impl UpdateApplier for MemoryApplier {
    fn load(&mut self, state: &[u8]) -> ClientResult<()> {
        self.entries = if state.is_empty() {
            BTreeMap::new()
        } else {
            from_cbor(state)?
        };
        Ok(())
    }

    fn apply(&mut self, position: UpdatePosition, delta: &[u8]) -> ClientResult<()> {
        for op in Delta::decode(delta)?.ops {
            match op {
                DeltaOp::Put { key, value } => self.write(key, Some(value), position),
                DeltaOp::Delete { key } => self.write(key, None, position),
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> ClientResult<Vec<u8>> {
        Ok(to_cbor(&self.entries)?)
    }
}

/// Builds compacted snapshots with the vault key, for running
/// [`SyncLog::compact`](ledgervault_server::SyncLog::compact) in a
/// process that holds the key.
pub struct KeyedCompactor<A> {
    vault_id: VaultId,
    keys: KeyRing,
    _applier: PhantomData<fn() -> A>,
}

impl<A: UpdateApplier + Default> KeyedCompactor<A> {
    /// Creates a compactor sealing with the newest key in `keys`.
    pub fn new(vault_id: VaultId, keys: KeyRing) -> Self {
        Self {
            vault_id,
            keys,
            _applier: PhantomData,
        }
    }

    fn fold(&self, base: &VaultSnapshot, updates: &[VaultUpdate]) -> ClientResult<Vec<u8>> {
        let mut replica = Replica::new(self.vault_id, A::default());
        replica.load_snapshot(base, &self.keys)?;
        for update in updates {
            replica.apply_update(update, &self.keys)?;
        }
        let (_, sealed) = self.keys.seal(&self.vault_id, &replica.state()?)?;
        Ok(sealed)
    }
}

impl<A: UpdateApplier + Default> SnapshotBuilder for KeyedCompactor<A> {
    fn build(&self, base: &VaultSnapshot, updates: &[VaultUpdate]) -> ServerResult<Vec<u8>> {
        self.fold(base, updates)
            .map_err(|e| ServerError::Internal(format!("snapshot build failed: {e}")))
    }
}

impl<A> std::fmt::Debug for KeyedCompactor<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCompactor")
            .field("vault_id", &self.vault_id)
            .field("epochs", &self.keys.len())
            .finish()
    }
}
