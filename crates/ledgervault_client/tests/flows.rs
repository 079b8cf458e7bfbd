//! End-to-end client flows against an in-process server.

use ledgervault_client::{
    unwrap_vault_keys, ClientConfig, ClientError, ClientResult, Delta, EncryptionKeypair,
    KeyedCompactor, LoopbackTransport, MemoryApplier, RealtimeStream, Replica, RetryConfig,
    VaultClient, VaultTransport,
};
use ledgervault_protocol::{DeviceKeypair, ErrorKind, HttpRequest, HttpResponse, RealtimeEvent, Role};
use ledgervault_server::ServerConfig;
use ledgervault_testkit::prelude::*;
use parking_lot::Mutex;
use std::time::Duration;

fn quick_retry() -> ClientConfig {
    ClientConfig::default().with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false),
    )
}

fn device(server: &TestServer) -> VaultClient<LoopbackTransport> {
    VaultClient::new(
        quick_retry(),
        LoopbackTransport::new(server.server.clone()),
        DeviceKeypair::generate(),
        EncryptionKeypair::generate(),
        server.clock.clone(),
    )
}

fn device_from(server: &TestServer, signing: [u8; 32], encryption: [u8; 32]) -> VaultClient<LoopbackTransport> {
    VaultClient::new(
        quick_retry(),
        LoopbackTransport::new(server.server.clone()),
        DeviceKeypair::from_secret_bytes(&signing).unwrap(),
        EncryptionKeypair::from_seed(encryption),
        server.clock.clone(),
    )
}

fn put(key: &str, value: &str) -> Vec<u8> {
    Delta::new().put(key, value.as_bytes().to_vec()).encode().unwrap()
}

fn replica(client: &VaultClient<LoopbackTransport>, vault_id: ledgervault_protocol::VaultId) -> Replica<MemoryApplier> {
    let mut replica = Replica::new(vault_id, MemoryApplier::new());
    client.sync(&mut replica).unwrap();
    replica
}

#[test]
fn invitee_reads_what_the_owner_wrote() {
    let server = TestServer::memory();
    let owner = device(&server);
    let guest = device(&server);

    let vault = owner.create_vault().unwrap();
    owner.append(&vault.id, 0, &put("title", "groceries")).unwrap();

    let ticket = owner.invite(&vault.id, Role::Member).unwrap();
    let membership = guest.accept(&ticket).unwrap();
    assert_eq!(membership.role, Role::Member);

    guest.append(&vault.id, 0, &put("milk", "2l")).unwrap();

    let owner_view = replica(&owner, vault.id);
    let guest_view = replica(&guest, vault.id);
    assert_eq!(owner_view.applier(), guest_view.applier());
    assert_eq!(guest_view.applier().get("title"), Some(&b"groceries"[..]));
    assert_eq!(owner_view.applier().get("milk"), Some(&b"2l"[..]));
}

#[test]
fn ticket_survives_text_transfer() {
    let server = TestServer::memory();
    let owner = device(&server);
    let guest = device(&server);
    let vault = owner.create_vault().unwrap();

    let text = owner.invite(&vault.id, Role::Member).unwrap().encode().unwrap();
    let ticket = ledgervault_client::InviteTicket::decode(&text).unwrap();
    guest.accept(&ticket).unwrap();

    let err = device(&server).accept(&ticket).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
}

#[test]
fn removed_member_loses_access_to_new_epoch() {
    let server = TestServer::memory();
    let owner = device(&server);
    let bob = device(&server);
    let carol = device(&server);
    let vault = owner.create_vault().unwrap();
    bob.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();
    carol.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();

    let epoch = owner.remove_member(&vault.id, &bob.pubkey_hash()).unwrap();
    assert_eq!(epoch, 1);
    assert_eq!(server.store().vault(&vault.id).unwrap().key_epoch, 1);
    assert!(server.store().membership(&vault.id, &bob.pubkey_hash()).is_none());

    let new_key = owner.key_ring(&vault.id).unwrap().get(1).cloned().unwrap();
    let bob_key = bob.key_ring(&vault.id).unwrap().get(0).cloned().unwrap();
    assert_ne!(bob_key, new_key);
    assert!(owner.key_ring(&vault.id).unwrap().get(0).is_some());

    let sealed = new_key.seal(&vault.id, 1, b"after").unwrap();
    assert!(bob_key.open(&vault.id, &sealed).is_err());
    assert!(matches!(
        bob.key_ring(&vault.id).unwrap().open(&vault.id, &sealed),
        Err(ClientError::NoVaultKey { key_epoch: 1, .. })
    ));

    let carol_wrapped = server
        .store()
        .membership(&vault.id, &carol.pubkey_hash())
        .and_then(|m| m.encrypted_vault_key)
        .unwrap();
    assert!(unwrap_vault_keys(&carol_wrapped, 1, &EncryptionKeypair::generate()).is_err());

    owner.append(&vault.id, 0, &put("secret", "after-removal")).unwrap();

    let carol_view = replica(&carol, vault.id);
    assert_eq!(carol_view.applier().get("secret"), Some(&b"after-removal"[..]));
    assert!(carol.key_ring(&vault.id).unwrap().get(1).is_some());

    let denied = bob.refresh_vault_key(&vault.id).unwrap_err();
    assert_eq!(denied.kind(), Some(ErrorKind::NotFound));
    let denied = bob.append(&vault.id, 0, &put("x", "y")).unwrap_err();
    assert_eq!(denied.kind(), Some(ErrorKind::NotFound));
    let mut stale = Replica::new(vault.id, MemoryApplier::new());
    assert!(bob.sync(&mut stale).is_err());
}

#[test]
fn stale_epoch_append_is_rejected() {
    let server = TestServer::memory();
    let owner = device(&server);
    let bob = device(&server);
    let vault = owner.create_vault().unwrap();
    bob.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();

    owner.rekey(&vault.id).unwrap();
    let err = bob.append(&vault.id, 0, &put("k", "v")).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::BadRequest));

    assert_eq!(bob.refresh_vault_key(&vault.id).unwrap(), 1);
    bob.append(&vault.id, 0, &put("k", "v")).unwrap();
}

#[test]
fn fetch_is_retried_but_append_is_not() {
    let server = TestServer::memory();
    let owner = device(&server);
    let vault = owner.create_vault().unwrap();

    owner.transport().lose_next_replies(1);
    let err = owner.append(&vault.id, 0, &put("once", "1")).unwrap_err();
    assert!(matches!(err, ClientError::Transport { retryable: true, .. }));
    assert_eq!(server.store().pending_update_count(&vault.id).unwrap(), 1);

    owner.transport().drop_next_requests(2);
    let view = replica(&owner, vault.id);
    assert_eq!(view.applied_count(), 1);
    assert_eq!(view.applier().get("once"), Some(&b"1"[..]));
    assert_eq!(server.store().pending_update_count(&vault.id).unwrap(), 1);
}

#[test]
fn retries_give_up_after_max_attempts() {
    let server = TestServer::memory();
    let owner = device(&server);
    let vault = owner.create_vault().unwrap();

    owner.transport().drop_next_requests(3);
    let mut view = Replica::new(vault.id, MemoryApplier::new());
    assert!(matches!(
        owner.sync(&mut view),
        Err(ClientError::Transport { .. })
    ));

    owner.cancel();
    assert!(matches!(owner.sync(&mut view), Err(ClientError::Cancelled)));
    owner.reset_cancel();
    owner.sync(&mut view).unwrap();
}

#[test]
fn sync_pages_through_the_log() {
    let server = TestServer::memory();
    let owner = VaultClient::new(
        quick_retry().with_fetch_batch(2),
        LoopbackTransport::new(server.server.clone()),
        DeviceKeypair::generate(),
        EncryptionKeypair::generate(),
        server.clock.clone(),
    );
    let vault = owner.create_vault().unwrap();
    for i in 0..5 {
        owner.append(&vault.id, 0, &put(&format!("k{i}"), "v")).unwrap();
    }

    let mut view = Replica::new(vault.id, MemoryApplier::new());
    let summary = owner.sync(&mut view).unwrap();
    assert_eq!(summary.pages, 3);
    assert_eq!(summary.applied, 5);
    assert_eq!(view.applier().len(), 5);

    let again = owner.sync(&mut view).unwrap();
    assert_eq!(again.applied, 0);
    assert_eq!(again.skipped, 5);
}

#[test]
fn compaction_with_the_vault_key() {
    let server = TestServer::with_config(ServerConfig::default().with_prune_after_compaction(true));
    let owner = device(&server);
    let vault = owner.create_vault().unwrap();
    owner.append(&vault.id, 0, &put("a", "1")).unwrap();
    owner.append(&vault.id, 0, &put("b", "2")).unwrap();
    owner.append(&vault.id, 0, &Delta::new().delete("a").encode().unwrap()).unwrap();

    let compactor = KeyedCompactor::<MemoryApplier>::new(vault.id, owner.key_ring(&vault.id).unwrap());
    let outcome = server.sync().compact(&vault.id, &compactor).unwrap().unwrap();
    assert_eq!(outcome.folded, 3);
    assert_eq!(outcome.pruned, 3);

    let guest = device(&server);
    guest.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();
    let mut view = Replica::new(vault.id, MemoryApplier::new());
    let summary = guest.sync(&mut view).unwrap();
    assert!(summary.reloaded);
    assert_eq!(summary.applied, 0);
    assert_eq!(view.snapshot_version(), outcome.snapshot.version);
    assert_eq!(view.applier().get("a"), None);
    assert_eq!(view.applier().get("b"), Some(&b"2"[..]));
}

#[test]
fn late_joiner_and_restarted_member_converge() {
    let server = TestServer::memory();
    let owner = device(&server);
    let bob = device(&server);
    let carol = device_from(&server, [7; 32], [9; 32]);
    let vault = owner.create_vault().unwrap();
    bob.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();
    carol.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();

    owner.append(&vault.id, 0, &put("rent", "900")).unwrap();
    carol.append(&vault.id, 0, &put("power", "60")).unwrap();
    owner.remove_member(&vault.id, &bob.pubkey_hash()).unwrap();
    owner.append(&vault.id, 0, &put("water", "30")).unwrap();
    drop(carol);

    let carol = device_from(&server, [7; 32], [9; 32]);
    carol.append(&vault.id, 0, &put("internet", "45")).unwrap();

    let late = device(&server);
    late.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();
    assert_eq!(late.key_ring(&vault.id).unwrap().len(), 2);

    let owner_view = replica(&owner, vault.id);
    for member in [&carol, &late] {
        let mut view = Replica::new(vault.id, MemoryApplier::new());
        let summary = member.sync(&mut view).unwrap();
        assert_eq!(summary.unreadable, 0);
        assert_eq!(summary.applied, 4);
        assert_eq!(view.applier(), owner_view.applier());
    }
    assert_eq!(owner_view.applier().get("rent"), Some(&b"900"[..]));
    assert_eq!(owner_view.applier().get("internet"), Some(&b"45"[..]));
}

#[test]
fn rotations_keep_every_retired_key() {
    let server = TestServer::memory();
    let owner = device(&server);
    let vault = owner.create_vault().unwrap();
    let member = device(&server);
    member.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();

    owner.rekey(&vault.id).unwrap();
    assert_eq!(owner.rekey(&vault.id).unwrap(), 2);

    let wrapped = server
        .store()
        .membership(&vault.id, &member.pubkey_hash())
        .and_then(|m| m.encrypted_vault_key)
        .unwrap();
    assert!(unwrap_vault_keys(&wrapped, 2, &EncryptionKeypair::generate()).is_err());

    assert_eq!(member.refresh_vault_key(&vault.id).unwrap(), 2);
    let ring = member.key_ring(&vault.id).unwrap();
    let owner_ring = owner.key_ring(&vault.id).unwrap();
    assert_eq!(ring.len(), 3);
    for epoch in 0..3 {
        assert_eq!(ring.get(epoch), owner_ring.get(epoch));
    }
}

/// Runs a hook once, right after the first request it carries.
struct HookedTransport {
    inner: LoopbackTransport,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl VaultTransport for HookedTransport {
    fn send(&self, request: &HttpRequest) -> ClientResult<HttpResponse> {
        let response = self.inner.send(request)?;
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(response)
    }

    fn subscribe(&self, request: &HttpRequest) -> ClientResult<RealtimeStream> {
        self.inner.subscribe(request)
    }
}

#[test]
fn sync_restarts_paging_when_the_snapshot_moves() {
    let server = TestServer::with_config(ServerConfig::default().with_prune_after_compaction(true));
    let owner = device(&server);
    let vault = owner.create_vault().unwrap();
    let bob = device(&server);
    bob.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();
    for i in 0..4 {
        owner.append(&vault.id, 0, &put(&format!("k{i}"), "v")).unwrap();
    }

    let reader = VaultClient::new(
        quick_retry().with_fetch_batch(2),
        HookedTransport {
            inner: LoopbackTransport::new(server.server.clone()),
            hook: Mutex::new(None),
        },
        DeviceKeypair::generate(),
        EncryptionKeypair::generate(),
        server.clock.clone(),
    );
    reader.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();

    // After the reader's first page: compact and prune everything, then
    // let a device with a lagging clock append before the reader's cursor.
    let compactor = KeyedCompactor::<MemoryApplier>::new(vault.id, owner.key_ring(&vault.id).unwrap());
    let embedded = server.server.clone();
    let vault_id = vault.id;
    *reader.transport().hook.lock() = Some(Box::new(move || {
        let outcome = embedded.sync().compact(&vault_id, &compactor).unwrap().unwrap();
        assert_eq!(outcome.pruned, 4);
        bob.append(&vault_id, 0, &put("late", "yes")).unwrap();
    }));

    let mut view = Replica::new(vault.id, MemoryApplier::new());
    let summary = reader.sync(&mut view).unwrap();
    assert!(summary.reloaded);
    assert_eq!(summary.pages, 3);
    assert_eq!(view.applier().get("late"), Some(&b"yes"[..]));
    assert_eq!(view.applier(), replica(&owner, vault.id).applier());
}

#[test]
fn leave_and_user_data() {
    let server = TestServer::memory();
    let owner = device(&server);
    let guest = device(&server);
    let vault = owner.create_vault().unwrap();
    guest.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();

    guest.leave(&vault.id).unwrap();
    assert!(guest.key_ring(&vault.id).is_none());
    assert_eq!(owner.list_members(&vault.id).unwrap().len(), 1);

    let owner_leave = owner.leave(&vault.id).unwrap_err();
    assert_eq!(owner_leave.kind(), Some(ErrorKind::BadRequest));

    assert_eq!(guest.get_user_data().unwrap_err().kind(), Some(ErrorKind::NotFound));
    guest.put_user_data(vec![1, 2, 3], "laptop").unwrap();
    let stored = guest.get_user_data().unwrap();
    assert_eq!(stored.encrypted_data, vec![1, 2, 3]);
    assert_eq!(stored.device_fingerprint, "laptop");

    owner.delete_vault(&vault.id).unwrap();
    assert!(owner.key_ring(&vault.id).is_none());
    assert_eq!(
        owner.list_members(&vault.id).unwrap_err().kind(),
        Some(ErrorKind::NotFound)
    );
}

#[tokio::test]
async fn realtime_updates_reach_other_devices() {
    let server = TestServer::memory();
    let owner = device(&server);
    let guest = device(&server);
    let vault = owner.create_vault().unwrap();
    guest.accept(&owner.invite(&vault.id, Role::Member).unwrap()).unwrap();

    let mut view = replica(&guest, vault.id);
    let mut stream = guest.subscribe(&vault.id).unwrap();

    let appended = owner.append(&vault.id, 0, &put("live", "yes")).unwrap();
    let update = loop {
        match stream.next().await {
            Some(event @ RealtimeEvent::UpdateInserted(_)) => break event,
            Some(RealtimeEvent::PresenceSync(_)) => continue,
            None => panic!("stream ended"),
        }
    };
    assert_eq!(update.update_id(), Some(appended.update_id));
    assert!(guest.apply_event(&mut view, &update).unwrap());
    assert!(!guest.apply_event(&mut view, &update).unwrap());
    assert_eq!(view.applier().get("live"), Some(&b"yes"[..]));

    let summary = guest.sync(&mut view).unwrap();
    assert_eq!(summary.applied, 0);

    owner.remove_member(&vault.id, &guest.pubkey_hash()).unwrap();
    loop {
        if stream.next().await.is_none() {
            break;
        }
    }
}
