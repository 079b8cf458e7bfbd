//! Hybrid logical clock for update timestamps.

use ledgervault_protocol::{Clock, HlcTimestamp};
use parking_lot::Mutex;
use std::sync::Arc;

/// Generates HLC timestamps for one device.
///
/// `now()` never returns the same or a smaller value twice, even if the
/// wall clock steps backwards, so a device's updates always pass the
/// server's per-author ordering check.
pub struct HybridClock {
    clock: Arc<dyn Clock>,
    node: u64,
    last: Mutex<HlcTimestamp>,
}

impl HybridClock {
    /// Creates a clock for `node` over a wall clock.
    pub fn new(clock: Arc<dyn Clock>, node: u64) -> Self {
        Self {
            clock,
            node,
            last: Mutex::new(HlcTimestamp::ZERO),
        }
    }

    /// Node id stamped into every timestamp.
    pub fn node(&self) -> u64 {
        self.node
    }

    /// Last timestamp issued or observed.
    pub fn last(&self) -> HlcTimestamp {
        *self.last.lock()
    }

    /// Issues a new timestamp.
    pub fn now(&self) -> HlcTimestamp {
        let wall = self.clock.now_millis();
        let mut last = self.last.lock();
        let next = if wall > last.physical_ms {
            HlcTimestamp::new(wall, 0, self.node)
        } else {
            match last.logical.checked_add(1) {
                Some(logical) => HlcTimestamp::new(last.physical_ms, logical, self.node),
                // Counter exhausted: borrow the next millisecond.
                None => HlcTimestamp::new(last.physical_ms.saturating_add(1), 0, self.node),
            }
        };
        *last = next;
        next
    }

    /// Merges a timestamp seen from another device so later local
    /// timestamps order after it.
    pub fn observe(&self, remote: HlcTimestamp) {
        let mut last = self.last.lock();
        if (remote.physical_ms, remote.logical) > (last.physical_ms, last.logical) {
            *last = HlcTimestamp::new(remote.physical_ms, remote.logical, self.node);
        }
    }
}

impl std::fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClock")
            .field("node", &self.node)
            .field("last", &*self.last.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgervault_protocol::ManualClock;

    #[test]
    fn strictly_increasing_under_a_frozen_clock() {
        let wall = Arc::new(ManualClock::new(1_000));
        let hlc = HybridClock::new(wall, 7);
        let a = hlc.now();
        let b = hlc.now();
        let c = hlc.now();
        assert!(a < b && b < c);
        assert_eq!(c, HlcTimestamp::new(1_000, 2, 7));
    }

    #[test]
    fn follows_the_wall_clock() {
        let wall = Arc::new(ManualClock::new(1_000));
        let hlc = HybridClock::new(wall.clone(), 1);
        hlc.now();
        wall.advance(5);
        assert_eq!(hlc.now(), HlcTimestamp::new(1_005, 0, 1));
    }

    #[test]
    fn survives_wall_clock_regression() {
        let wall = Arc::new(ManualClock::new(5_000));
        let hlc = HybridClock::new(wall.clone(), 1);
        let before = hlc.now();
        wall.set(1_000);
        let after = hlc.now();
        assert!(after > before);
        assert_eq!(after.physical_ms, 5_000);
    }

    #[test]
    fn observe_moves_past_remote() {
        let wall = Arc::new(ManualClock::new(1_000));
        let hlc = HybridClock::new(wall, 1);
        let remote = HlcTimestamp::new(9_000, 4, 99);
        hlc.observe(remote);
        let next = hlc.now();
        assert!(next > remote);
        assert_eq!(next, HlcTimestamp::new(9_000, 5, 1));

        hlc.observe(HlcTimestamp::new(10, 0, 3));
        assert!(hlc.now() > next);
    }

    #[test]
    fn exhausted_counter_moves_to_the_next_millisecond() {
        let wall = Arc::new(ManualClock::new(1_000));
        let hlc = HybridClock::new(wall, 1);
        let remote = HlcTimestamp::new(1_000, u32::MAX, 3);
        hlc.observe(remote);
        let next = hlc.now();
        assert!(next > remote);
        assert_eq!(next, HlcTimestamp::new(1_001, 0, 1));
        assert_eq!(hlc.now(), HlcTimestamp::new(1_001, 1, 1));
    }
}
