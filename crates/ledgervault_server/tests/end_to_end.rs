//! Full member lifecycle over signed RPC calls and a live subscription.

use ledgervault_protocol::{
    Ack, ErrorKind, FetchSinceRequest, HlcTimestamp, MemberKey, RealtimeEvent, RekeyRequest,
    RekeyResponse, RemoveMemberRequest, RemoveMemberResponse, RpcOperation, VaultRequest,
};
use ledgervault_server::SubscriptionState;
use ledgervault_testkit::prelude::*;
use std::time::Duration;

async fn next_update(subscription: &mut ledgervault_server::Subscription) -> RealtimeEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("subscription closed");
        if event.update_id().is_some() {
            return event;
        }
    }
}

#[tokio::test]
async fn invite_append_remove_rekey() {
    let server = TestServer::memory();
    let a = TestDevice::generate();
    let b = TestDevice::generate();
    let c = TestDevice::generate();
    let vault_id = server.create_vault(&a);

    let (invite, invite_key) = server.invite(&a, vault_id, ledgervault_protocol::Role::Member).unwrap();
    server.accept(&b, &invite, &invite_key).unwrap();
    server.join(&a, vault_id, &c);

    let mut a_feed = server.subscribe(&a, vault_id).unwrap();
    let mut b_feed = server.subscribe(&b, vault_id).unwrap();

    let u1 = server
        .append(&b, vault_id, HlcTimestamp::new(TEST_EPOCH_MS, 0, 2), b"u1")
        .unwrap();
    let RealtimeEvent::UpdateInserted(notification) = next_update(&mut a_feed).await else {
        unreachable!("next_update only yields updates");
    };
    assert_eq!(notification.id, u1.update_id);
    assert_eq!(notification.author_pubkey_hash, b.pubkey_hash());
    assert_eq!(notification.key_epoch, 0);

    // Phase one: remove B.
    let removed: RemoveMemberResponse = server
        .call(
            &a,
            RpcOperation::RemoveMember,
            &RemoveMemberRequest {
                vault_id,
                target: b.pubkey_hash(),
            },
        )
        .unwrap();
    let targets: Vec<_> = removed.remaining.iter().map(|t| t.pubkey_hash).collect();
    assert_eq!(targets.len(), 2);
    assert!(!targets.contains(&b.pubkey_hash()));

    // B's live subscription is gone.
    while b_feed.recv().await.is_some() {}
    assert_eq!(b_feed.state(), SubscriptionState::Unsubscribed);

    // Phase two: rekey the remaining members.
    let rekeyed: RekeyResponse = server
        .call(
            &a,
            RpcOperation::Rekey,
            &RekeyRequest {
                vault_id,
                member_keys: vec![
                    MemberKey {
                        pubkey_hash: a.pubkey_hash(),
                        encrypted_vault_key: a.wrapped_key(1),
                    },
                    MemberKey {
                        pubkey_hash: c.pubkey_hash(),
                        encrypted_vault_key: c.wrapped_key(1),
                    },
                ],
            },
        )
        .unwrap();
    assert_eq!(rekeyed.key_epoch, 1);

    let u2 = server
        .append(&a, vault_id, HlcTimestamp::new(TEST_EPOCH_MS + 1, 0, 1), b"u2")
        .unwrap();
    let RealtimeEvent::UpdateInserted(notification) = next_update(&mut a_feed).await else {
        unreachable!("next_update only yields updates");
    };
    assert_eq!(notification.id, u2.update_id);
    assert_eq!(notification.key_epoch, 1);

    // B can no longer read or write.
    let err = server.fetch(&b, &FetchSinceRequest::new(vault_id, 0)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    let err = server
        .append(&b, vault_id, HlcTimestamp::new(TEST_EPOCH_MS + 2, 0, 2), b"late")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    // Every update after u1 carries the new epoch.
    let log = server.fetch(&c, &FetchSinceRequest::new(vault_id, 0)).unwrap();
    assert!(log
        .updates
        .iter()
        .filter(|u| u.id > u1.update_id)
        .all(|u| u.key_epoch == 1));

    // Stale-epoch writes are refused.
    let stale = server.call::<_, ledgervault_protocol::AppendUpdateResponse>(
        &c,
        RpcOperation::AppendUpdate,
        &ledgervault_protocol::AppendUpdateRequest {
            vault_id,
            base_snapshot_version: 0,
            hlc_timestamp: HlcTimestamp::new(TEST_EPOCH_MS + 3, 0, 3),
            key_epoch: 0,
            encrypted_data: b"old key".to_vec(),
        },
    );
    assert_eq!(stale.unwrap_err().kind, ErrorKind::BadRequest);

    let members = server.members(&a, vault_id).unwrap();
    assert!(members.iter().all(|m| m.key_epoch == 1));
}

#[tokio::test]
async fn leave_and_delete_close_subscriptions() {
    let server = TestServer::memory();
    let a = TestDevice::generate();
    let b = TestDevice::generate();
    let vault_id = server.create_vault(&a);
    server.join(&a, vault_id, &b);

    let mut b_feed = server.subscribe(&b, vault_id).unwrap();
    let _: Ack = server
        .call(&b, RpcOperation::LeaveVault, &VaultRequest { vault_id })
        .unwrap();
    while b_feed.recv().await.is_some() {}
    assert_eq!(b_feed.state(), SubscriptionState::Unsubscribed);

    let mut a_feed = server.subscribe(&a, vault_id).unwrap();
    let _: Ack = server
        .call(&a, RpcOperation::DeleteVault, &VaultRequest { vault_id })
        .unwrap();
    while a_feed.recv().await.is_some() {}
    assert!(server.store().vault(&vault_id).is_none());
}

#[tokio::test]
async fn sweeper_task_expires_silent_subscribers() {
    let server = TestServer::with_config(
        ledgervault_server::ServerConfig::default().with_presence_timeout(Duration::from_secs(1)),
    );
    let a = TestDevice::generate();
    let vault_id = server.create_vault(&a);
    let mut feed = server.subscribe(&a, vault_id).unwrap();

    server.advance(5_000);
    let task = server.hub().spawn_sweeper(Duration::from_millis(10));
    tokio::time::timeout(Duration::from_secs(5), async {
        while feed.recv().await.is_some() {}
    })
    .await
    .expect("subscription was not expired");
    assert_eq!(server.hub().subscriber_count(&vault_id), 0);
    task.abort();
}
