//! Property tests for the log's total order and pagination.

use ledgervault_protocol::{
    DeviceKeypair, HlcTimestamp, ManualClock, PubkeyHash, Role, VaultId, VaultMembership,
};
use ledgervault_store::{NewUpdate, NewVault, VaultStore};
use proptest::prelude::*;
use std::sync::Arc;

fn store_with_authors(authors: usize) -> (VaultStore, VaultId, Vec<PubkeyHash>) {
    let store = VaultStore::open_in_memory(Arc::new(ManualClock::new(0))).unwrap();
    let ids: Vec<_> = (0..authors)
        .map(|_| DeviceKeypair::generate().pubkey_hash())
        .collect();
    let vault_id = VaultId::new();
    store
        .create_vault(NewVault {
            id: vault_id,
            owner: ids[0],
            encrypted_vault_key: vec![0],
            enc_public_key: None,
            genesis_data: vec![],
            genesis_hlc: HlcTimestamp::ZERO,
        })
        .unwrap();
    for id in &ids[1..] {
        store
            .insert_membership(VaultMembership {
                vault_id,
                pubkey_hash: *id,
                role: Role::Member,
                encrypted_vault_key: Some(vec![0]),
                enc_public_key: None,
                key_epoch: 0,
                joined_at: 0,
            })
            .unwrap();
    }
    (store, vault_id, ids)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever order authors append in, reads come back sorted by
    /// (hlc, id), and paging with any page size yields the same sequence.
    #[test]
    fn reads_follow_total_order(
        steps in prop::collection::vec((0usize..3, 0u64..40, 0u32..3), 1..40),
        page in 1usize..7,
    ) {
        let (store, vault_id, authors) = store_with_authors(3);
        let mut heads = [HlcTimestamp::ZERO; 3];

        for (author, physical, logical) in steps {
            // Keep each author's clock strictly increasing.
            let head = heads[author];
            let proposed = HlcTimestamp::new(physical, logical, author as u64);
            let hlc = if proposed > head {
                proposed
            } else {
                HlcTimestamp::new(head.physical_ms, head.logical + 1, author as u64)
            };
            heads[author] = hlc;
            store.append_update(NewUpdate {
                vault_id,
                author: authors[author],
                base_snapshot_version: 0,
                hlc_timestamp: hlc,
                key_epoch: 0,
                encrypted_data: vec![],
            }).unwrap();
        }

        let all = store.updates_after(&vault_id, 0, None, usize::MAX).unwrap();
        prop_assert!(!all.has_more);
        let positions: Vec<_> = all.updates.iter().map(|u| u.position()).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        prop_assert_eq!(&positions, &sorted);

        let mut paged = Vec::new();
        let mut after = None;
        loop {
            let chunk = store.updates_after(&vault_id, 0, after, page).unwrap();
            paged.extend(chunk.updates.iter().map(|u| u.position()));
            after = chunk.updates.last().map(|u| u.position());
            if !chunk.has_more {
                break;
            }
        }
        prop_assert_eq!(paged, positions);
    }
}
