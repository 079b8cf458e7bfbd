//! # LedgerVault Client
//!
//! Device-side SDK for LedgerVault vaults.
//!
//! This crate provides:
//! - Request signing with the device key (`RequestSigner`)
//! - A hybrid logical clock for update timestamps (`HybridClock`)
//! - Vault key sealing and X25519 key wrapping (`VaultKey`, `KeyRing`)
//! - Idempotent replay of snapshots and updates (`Replica`, `MemoryApplier`)
//! - A transport abstraction with an in-process loopback (`LoopbackTransport`)
//! - The high-level flows: create, invite, accept, append, sync, subscribe,
//!   remove-and-rekey, leave and user data (`VaultClient`)
//!
//! ## Example
//!
//! ```rust
//! use ledgervault_client::{
//!     ClientConfig, Delta, EncryptionKeypair, LoopbackTransport, MemoryApplier, Replica,
//!     VaultClient,
//! };
//! use ledgervault_protocol::{DeviceKeypair, SystemClock};
//! use ledgervault_server::{ServerConfig, VaultServer};
//! use ledgervault_store::VaultStore;
//! use std::sync::Arc;
//!
//! let store = VaultStore::open_in_memory(Arc::new(SystemClock)).unwrap();
//! let server = VaultServer::new(ServerConfig::default(), Arc::new(store));
//! let client = VaultClient::new(
//!     ClientConfig::default(),
//!     LoopbackTransport::new(server),
//!     DeviceKeypair::generate(),
//!     EncryptionKeypair::generate(),
//!     Arc::new(SystemClock),
//! );
//!
//! let vault = client.create_vault().unwrap();
//! let delta = Delta::new().put("note", b"hello".to_vec());
//! client.append(&vault.id, 0, &delta.encode().unwrap()).unwrap();
//!
//! let mut replica = Replica::new(vault.id, MemoryApplier::new());
//! client.sync(&mut replica).unwrap();
//! assert_eq!(replica.applier().get("note"), Some(&b"hello"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod client;
mod config;
pub mod crypto;
mod error;
mod hlc;
mod invite;
pub mod replay;
mod signer;
mod transport;

pub use client::{SyncSummary, VaultClient};
pub use config::{ClientConfig, RetryConfig};
pub use crypto::{unwrap_vault_keys, wrap_vault_keys, EncryptionKeypair, KeyRing, VaultKey};
pub use error::{ClientError, ClientResult};
pub use hlc::HybridClock;
pub use invite::InviteTicket;
pub use replay::{Delta, DeltaOp, KeyedCompactor, MemoryApplier, Replica, UpdateApplier};
pub use signer::RequestSigner;
pub use transport::{EventSource, LoopbackTransport, RealtimeStream, VaultTransport};
