//! # LedgerVault Server
//!
//! Trust and sync layer for end-to-end encrypted, multi-device vaults.
//!
//! This crate provides:
//! - Request authentication (Ed25519 signed headers with a freshness window)
//! - The sync log: append, paginated fetch, compaction and pruning
//! - Realtime fan-out of appended updates and presence
//! - Vault lifecycle, invites, member removal and atomic re-keying
//! - Per-device user data
//!
//! # Architecture
//!
//! The server never sees plaintext. Vault contents travel as opaque
//! ciphertext; the server authenticates callers, enforces membership and
//! ordering rules, and stores what it is given in a [`VaultStore`].
//!
//! [`VaultServer::handle`] takes one signed `POST /rpc/<operation>` call with
//! a CBOR body and returns a CBOR response. [`VaultServer::subscribe`] serves
//! `GET /realtime/<vault_id>`.
//!
//! # Removal and re-keying
//!
//! Removing a member is two calls: `membership.remove` returns the remaining
//! members' key-encapsulation keys, and `membership.rekey` installs a new
//! vault key wrapped for each of them in one store operation. Appends under
//! the old key epoch are rejected from then on.
//!
//! [`VaultStore`]: ledgervault_store::VaultStore

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod access;
mod accounts;
mod auth;
mod config;
mod error;
mod membership;
mod realtime;
mod server;
mod sync;

pub use accounts::Accounts;
pub use auth::{AuthConfig, AuthContext, AuthHeaders, RequestAuthenticator, Verification};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use membership::MembershipCoordinator;
pub use realtime::{RealtimeHub, Subscription, SubscriptionState};
pub use server::VaultServer;
pub use sync::{CompactionOutcome, SnapshotBuilder, SyncLog};
