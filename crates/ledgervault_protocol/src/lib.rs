//! # LedgerVault Protocol
//!
//! Identity, signing, data model and wire messages for LedgerVault.
//!
//! This crate provides:
//! - Device identities (`DeviceKeypair`, `PubkeyHash`)
//! - Canonical request signing over method, path, body and timestamp
//! - Hybrid logical clock timestamps and the log's total order key
//! - The vault data model (vaults, memberships, invites, snapshots, updates)
//! - RPC request/response bodies and realtime events
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod codec;
mod error;
pub mod events;
pub mod hlc;
pub mod http;
pub mod identity;
pub mod messages;
pub mod model;
pub mod signing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{from_cbor, to_cbor, CborMessage};
pub use error::{ProtocolError, ProtocolResult};
pub use events::{PresenceEntry, RealtimeEvent, UpdateNotification};
pub use hlc::{HlcTimestamp, UpdatePosition};
pub use http::{ErrorBody, ErrorKind, HttpRequest, HttpResponse, RpcOperation};
pub use identity::{DeviceKeypair, DevicePublicKey, PubkeyHash};
pub use messages::*;
pub use model::{
    InviteId, MemberInfo, MemberKey, RekeyTarget, Role, UserData, Vault, VaultId, VaultInvite,
    VaultMembership, VaultSnapshot, VaultUpdate,
};
pub use signing::SignedHeaders;
