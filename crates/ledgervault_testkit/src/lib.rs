//! # LedgerVault Testkit
//!
//! Test utilities for LedgerVault.
//!
//! This crate provides:
//! - An in-process server on a pinned clock, with signed-call helpers
//! - Test devices and vault scenarios (invite, accept, append)
//! - Property-based test generators using proptest
//! - Signing payload vectors
//!
//! ## Usage
//!
//! ```rust
//! use ledgervault_testkit::prelude::*;
//!
//! let server = TestServer::memory();
//! let owner = TestDevice::generate();
//! let vault_id = server.create_vault(&owner);
//! assert_eq!(server.members(&owner, vault_id).unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::vectors::*;
}

pub use fixtures::*;
pub use generators::*;
pub use vectors::*;
