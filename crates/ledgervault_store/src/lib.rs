//! # LedgerVault Store
//!
//! The system of record for LedgerVault: vaults, memberships, invites,
//! snapshots, updates and per-device user data.
//!
//! ## Design
//!
//! - Tables live in memory and are rebuilt on open by replaying a journal
//! - Each mutation is one CBOR journal record, framed with a CRC32
//! - Multi-row changes (vault creation, invite acceptance, key rotation)
//!   are single records, so they are atomic across crashes and failures
//! - The journal sits on a [`StorageBackend`]: in memory or a file
//! - File stores hold an exclusive `fs2` lock on their directory
//!
//! ## Example
//!
//! ```rust
//! use ledgervault_protocol::{DeviceKeypair, HlcTimestamp, ManualClock, VaultId};
//! use ledgervault_store::{NewVault, VaultStore};
//! use std::sync::Arc;
//!
//! let store = VaultStore::open_in_memory(Arc::new(ManualClock::new(1_000))).unwrap();
//! let owner = DeviceKeypair::generate().pubkey_hash();
//! let vault = store
//!     .create_vault(NewVault {
//!         id: VaultId::new(),
//!         owner,
//!         encrypted_vault_key: vec![1, 2, 3],
//!         enc_public_key: None,
//!         genesis_data: vec![],
//!         genesis_hlc: HlcTimestamp::new(1_000, 0, 1),
//!     })
//!     .unwrap();
//! assert_eq!(store.latest_snapshot(&vault.id).unwrap().version, 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
mod config;
mod dir;
mod error;
pub mod journal;
mod record;
mod store;
mod tables;

pub use backend::{FileBackend, InMemoryBackend, StorageBackend, StorageError, StorageResult};
pub use config::StoreConfig;
pub use dir::StoreDir;
pub use error::{StoreError, StoreResult};
pub use journal::JournalStats;
pub use record::JournalRecord;
pub use store::{
    CommitListener, NewUpdate, NewVault, StoreStats, UpdatePage, VaultStore, VaultSummary,
};
