//! Property-based test generators using proptest.

use ledgervault_protocol::{HlcTimestamp, PubkeyHash};
use proptest::prelude::*;

/// Strategy for HLC timestamps in a narrow range, so collisions on the
/// physical part are common.
pub fn hlc_strategy() -> impl Strategy<Value = HlcTimestamp> {
    (0u64..64, 0u32..4, 0u64..4).prop_map(|(p, l, n)| HlcTimestamp::new(p, l, n))
}

/// Strategy for identity hashes.
pub fn pubkey_hash_strategy() -> impl Strategy<Value = PubkeyHash> {
    prop::array::uniform32(any::<u8>()).prop_map(PubkeyHash::from_bytes)
}

/// Strategy for opaque ciphertext payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for an interleaved append schedule across `authors` devices.
///
/// Each entry is `(author index, hlc)`. Per author the timestamps are
/// strictly increasing, matching what an honest device produces; across authors
/// they interleave freely.
pub fn append_schedule_strategy(
    authors: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<(usize, HlcTimestamp)>> {
    prop::collection::vec((0..authors.max(1), 0u64..8, 0u32..3), 1..max_len.max(2)).prop_map(
        move |steps| {
            let mut heads = vec![HlcTimestamp::ZERO; authors.max(1)];
            steps
                .into_iter()
                .map(|(author, bump, logical)| {
                    let head = heads[author];
                    let next = HlcTimestamp::new(
                        head.physical_ms + bump,
                        if bump == 0 { head.logical + logical + 1 } else { logical },
                        author as u64,
                    );
                    heads[author] = next;
                    (author, next)
                })
                .collect()
        },
    )
}
