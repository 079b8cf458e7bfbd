//! Hybrid logical clock timestamps and the log's total order key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// A hybrid logical clock timestamp.
///
/// Ordering is lexicographic over `(physical_ms, logical, node)`, so two
/// timestamps from different devices are always comparable. The node id
/// breaks ties between devices that produce the same `(physical, logical)`
/// pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HlcTimestamp {
    /// Wall-clock component, epoch milliseconds.
    pub physical_ms: u64,
    /// Logical counter within one millisecond.
    pub logical: u32,
    /// Originating node id.
    pub node: u64,
}

impl HlcTimestamp {
    /// The zero timestamp, ordered before every other.
    pub const ZERO: Self = Self {
        physical_ms: 0,
        logical: 0,
        node: 0,
    };

    /// Creates a timestamp.
    #[must_use]
    pub const fn new(physical_ms: u64, logical: u32, node: u64) -> Self {
        Self {
            physical_ms,
            logical,
            node,
        }
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:013}-{:08x}-{:016x}",
            self.physical_ms, self.logical, self.node
        )
    }
}

impl FromStr for HlcTimestamp {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let bad = || ProtocolError::decode(format!("malformed hlc timestamp: {s}"));
        let physical_ms = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(bad)?;
        let logical = parts
            .next()
            .and_then(|p| u32::from_str_radix(p, 16).ok())
            .ok_or_else(bad)?;
        let node = parts
            .next()
            .and_then(|p| u64::from_str_radix(p, 16).ok())
            .ok_or_else(bad)?;
        Ok(Self::new(physical_ms, logical, node))
    }
}

/// Position of an update in the vault's total order.
///
/// Sorting by `(hlc, update_id)` gives every replica the same replay
/// sequence without a global sequence counter. The insertion id only breaks
/// exact HLC ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdatePosition {
    /// HLC timestamp of the update.
    pub hlc: HlcTimestamp,
    /// Store-assigned insertion id.
    pub update_id: u64,
}

impl UpdatePosition {
    /// Creates a position.
    #[must_use]
    pub const fn new(hlc: HlcTimestamp, update_id: u64) -> Self {
        Self { hlc, update_id }
    }
}
