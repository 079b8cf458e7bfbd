//! Realtime events pushed to vault subscribers.

use crate::hlc::HlcTimestamp;
use crate::identity::PubkeyHash;
use crate::model::VaultUpdate;
use serde::{Deserialize, Serialize};

/// Notification that a new update was appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNotification {
    /// Update id; consumers dedup on it.
    pub id: u64,
    /// Encrypted delta.
    pub encrypted_data: Vec<u8>,
    /// Base snapshot version.
    pub base_snapshot_version: u64,
    /// Author HLC timestamp.
    pub hlc_timestamp: HlcTimestamp,
    /// Author identity.
    pub author_pubkey_hash: PubkeyHash,
    /// Key epoch of the payload.
    pub key_epoch: u32,
    /// Insertion time.
    pub created_at: u64,
}

impl From<&VaultUpdate> for UpdateNotification {
    fn from(update: &VaultUpdate) -> Self {
        Self {
            id: update.id,
            encrypted_data: update.encrypted_data.clone(),
            base_snapshot_version: update.base_snapshot_version,
            hlc_timestamp: update.hlc_timestamp,
            author_pubkey_hash: update.author_pubkey_hash,
            key_epoch: update.key_epoch,
            created_at: update.created_at,
        }
    }
}

/// One tracked connection in a presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Connected identity.
    pub user_id: PubkeyHash,
    /// When the connection subscribed.
    pub joined_at: u64,
    /// Last heartbeat.
    pub last_seen: u64,
}

/// An event delivered on a realtime subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEvent {
    /// A new update row for the subscribed vault.
    UpdateInserted(UpdateNotification),
    /// Full recomputation of the vault's presence.
    PresenceSync(Vec<PresenceEntry>),
}

impl RealtimeEvent {
    /// Returns the update id for update events.
    #[must_use]
    pub fn update_id(&self) -> Option<u64> {
        match self {
            RealtimeEvent::UpdateInserted(n) => Some(n.id),
            RealtimeEvent::PresenceSync(_) => None,
        }
    }
}
