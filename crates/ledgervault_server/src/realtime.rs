//! Realtime fan-out of appended updates and presence.
//!
//! Each subscription owns an unbounded channel. The store's commit listener
//! pushes every appended update to the subscribers of its vault; closed
//! channels are dropped on the next publish. Presence is tracked per
//! connection and re-broadcast in full whenever it changes.

use crate::access::require_member;
use crate::auth::AuthContext;
use crate::error::{ServerError, ServerResult};
use ledgervault_protocol::{
    Clock, PresenceEntry, PubkeyHash, RealtimeEvent, UpdateNotification, VaultId, VaultUpdate,
};
use ledgervault_store::{CommitListener, VaultStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Lifecycle of a subscription. A device with no [`Subscription`] value is
/// disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, membership not yet confirmed.
    Subscribing,
    /// Receiving events.
    Subscribed,
    /// Closed by the client, evicted, or expired. Terminal.
    Unsubscribed,
}

struct Subscriber {
    id: u64,
    pubkey_hash: PubkeyHash,
    joined_at: u64,
    last_seen: u64,
    tx: UnboundedSender<RealtimeEvent>,
}

impl Subscriber {
    fn presence(&self) -> PresenceEntry {
        PresenceEntry {
            user_id: self.pubkey_hash,
            joined_at: self.joined_at,
            last_seen: self.last_seen,
        }
    }
}

struct HubInner {
    clock: Arc<dyn Clock>,
    presence_timeout: Duration,
    next_id: AtomicU64,
    channels: RwLock<HashMap<VaultId, Vec<Subscriber>>>,
}

fn presence_of(subscribers: &[Subscriber]) -> Vec<PresenceEntry> {
    let mut entries: Vec<_> = subscribers.iter().map(Subscriber::presence).collect();
    entries.sort_by_key(|e| (e.joined_at, e.user_id));
    entries
}

fn broadcast_presence(subscribers: &mut Vec<Subscriber>) {
    let event = RealtimeEvent::PresenceSync(presence_of(subscribers));
    subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
}

impl HubInner {
    fn register(&self, vault_id: VaultId, pubkey_hash: PubkeyHash) -> (u64, UnboundedReceiver<RealtimeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();
        self.channels.write().entry(vault_id).or_default().push(Subscriber {
            id,
            pubkey_hash,
            joined_at: now,
            last_seen: now,
            tx,
        });
        (id, rx)
    }

    fn broadcast(&self, vault_id: &VaultId) {
        let mut channels = self.channels.write();
        if let Some(subscribers) = channels.get_mut(vault_id) {
            broadcast_presence(subscribers);
        }
    }

    /// Removes one subscriber. Returns false if it was not tracked.
    fn release(&self, vault_id: &VaultId, id: u64) -> bool {
        let mut channels = self.channels.write();
        let Some(subscribers) = channels.get_mut(vault_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() == before {
            return false;
        }
        if subscribers.is_empty() {
            channels.remove(vault_id);
        } else {
            broadcast_presence(subscribers);
        }
        true
    }

    fn touch(&self, vault_id: &VaultId, id: u64) -> bool {
        let now = self.clock.now_millis();
        let mut channels = self.channels.write();
        let Some(subscribers) = channels.get_mut(vault_id) else {
            return false;
        };
        let Some(subscriber) = subscribers.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        subscriber.last_seen = now;
        broadcast_presence(subscribers);
        true
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let timeout = u64::try_from(self.presence_timeout.as_millis()).unwrap_or(u64::MAX);
        let mut channels = self.channels.write();
        let mut expired = 0;
        for subscribers in channels.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| now.saturating_sub(s.last_seen) <= timeout);
            if subscribers.len() != before {
                expired += before - subscribers.len();
                broadcast_presence(subscribers);
            }
        }
        channels.retain(|_, subscribers| !subscribers.is_empty());
        if expired > 0 {
            debug!(expired, "stale presence expired");
        }
        expired
    }
}

impl CommitListener for HubInner {
    fn update_appended(&self, update: &VaultUpdate) {
        let mut channels = self.channels.write();
        if let Some(subscribers) = channels.get_mut(&update.vault_id) {
            let event = RealtimeEvent::UpdateInserted(UpdateNotification::from(update));
            subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
        }
    }

    fn member_removed(&self, vault_id: &VaultId, pubkey_hash: &PubkeyHash) {
        let mut channels = self.channels.write();
        let Some(subscribers) = channels.get_mut(vault_id) else {
            return;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.pubkey_hash != *pubkey_hash);
        let evicted = before - subscribers.len();
        if evicted == 0 {
            return;
        }
        info!(vault_id = %vault_id, member = %pubkey_hash.short(), evicted, "subscriptions evicted");
        if subscribers.is_empty() {
            channels.remove(vault_id);
        } else {
            broadcast_presence(subscribers);
        }
    }

    fn vault_deleted(&self, vault_id: &VaultId) {
        if let Some(subscribers) = self.channels.write().remove(vault_id) {
            info!(vault_id = %vault_id, evicted = subscribers.len(), "vault subscriptions closed");
        }
    }
}

/// Fan-out hub for all vaults.
#[derive(Clone)]
pub struct RealtimeHub {
    store: Arc<VaultStore>,
    inner: Arc<HubInner>,
}

impl RealtimeHub {
    /// Creates a hub and installs it as the store's commit listener.
    pub fn new(store: Arc<VaultStore>, presence_timeout: Duration) -> Self {
        let inner = Arc::new(HubInner {
            clock: store.clock().clone(),
            presence_timeout,
            next_id: AtomicU64::new(1),
            channels: RwLock::new(HashMap::new()),
        });
        store.set_commit_listener(inner.clone());
        Self { store, inner }
    }

    /// Subscribes the caller to a vault it belongs to.
    ///
    /// Membership is checked again after registering so a removal racing
    /// with the subscribe cannot leave a live subscription behind.
    pub fn subscribe(&self, ctx: &AuthContext, vault_id: &VaultId) -> ServerResult<Subscription> {
        require_member(&self.store, ctx, vault_id)?;
        let (id, rx) = self.inner.register(*vault_id, ctx.pubkey_hash);
        let mut subscription = Subscription {
            id,
            vault_id: *vault_id,
            pubkey_hash: ctx.pubkey_hash,
            hub: self.inner.clone(),
            rx,
            state: SubscriptionState::Subscribing,
        };

        if self.store.membership(vault_id, &ctx.pubkey_hash).is_none() {
            subscription.unsubscribe();
            return Err(ServerError::not_found_vault());
        }
        subscription.state = SubscriptionState::Subscribed;
        self.inner.broadcast(vault_id);
        debug!(vault_id = %vault_id, member = %ctx.pubkey_hash.short(), id, "subscribed");
        Ok(subscription)
    }

    /// Current presence of a vault.
    #[must_use]
    pub fn presence(&self, vault_id: &VaultId) -> Vec<PresenceEntry> {
        self.inner
            .channels
            .read()
            .get(vault_id)
            .map(|s| presence_of(s))
            .unwrap_or_default()
    }

    /// Number of live subscriptions to a vault.
    #[must_use]
    pub fn subscriber_count(&self, vault_id: &VaultId) -> usize {
        self.inner.channels.read().get(vault_id).map_or(0, Vec::len)
    }

    /// Expires subscriptions without a heartbeat within the presence
    /// timeout. Returns how many were expired.
    pub fn sweep_stale_presence(&self) -> usize {
        self.inner.sweep()
    }

    /// Runs [`Self::sweep_stale_presence`] on a Tokio interval. The task
    /// ends once the hub is dropped.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let inner: Weak<HubInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match inner.upgrade() {
                    Some(inner) => {
                        inner.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}

impl fmt::Debug for RealtimeHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeHub")
            .field("vaults", &self.inner.channels.read().len())
            .field("presence_timeout", &self.inner.presence_timeout)
            .finish()
    }
}

/// A live subscription to one vault. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    vault_id: VaultId,
    pubkey_hash: PubkeyHash,
    hub: Arc<HubInner>,
    rx: UnboundedReceiver<RealtimeEvent>,
    state: SubscriptionState,
}

impl Subscription {
    /// Vault this subscription follows.
    #[must_use]
    pub fn vault_id(&self) -> &VaultId {
        &self.vault_id
    }

    /// Subscriber identity.
    #[must_use]
    pub fn pubkey_hash(&self) -> &PubkeyHash {
        &self.pubkey_hash
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Waits for the next event. Returns `None` once unsubscribed, evicted
    /// or expired.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Polls for the next event.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<RealtimeEvent>> {
        if self.state != SubscriptionState::Subscribed {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                self.state = SubscriptionState::Unsubscribed;
                Poll::Ready(None)
            }
            other => other,
        }
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<RealtimeEvent> {
        if self.state != SubscriptionState::Subscribed {
            return None;
        }
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.state = SubscriptionState::Unsubscribed;
                None
            }
        }
    }

    /// Refreshes `last_seen` and re-broadcasts presence. Returns false if
    /// the subscription is no longer tracked.
    pub fn heartbeat(&mut self) -> bool {
        if self.state != SubscriptionState::Subscribed {
            return false;
        }
        let tracked = self.hub.touch(&self.vault_id, self.id);
        if !tracked {
            self.state = SubscriptionState::Unsubscribed;
        }
        tracked
    }

    /// Stops delivery immediately. Queued events are discarded. Calling it
    /// again does nothing.
    pub fn unsubscribe(&mut self) {
        if self.state == SubscriptionState::Unsubscribed {
            return;
        }
        self.state = SubscriptionState::Unsubscribed;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        if self.hub.release(&self.vault_id, self.id) {
            debug!(vault_id = %self.vault_id, id = self.id, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("vault_id", &self.vault_id)
            .field("member", &self.pubkey_hash.short())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgervault_protocol::{DeviceKeypair, HlcTimestamp, ManualClock, Role, VaultMembership};
    use ledgervault_store::{NewUpdate, NewVault};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<VaultStore>,
        hub: RealtimeHub,
        vault_id: VaultId,
        owner: AuthContext,
        member: AuthContext,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(VaultStore::open_in_memory(clock.clone()).unwrap());
        let hub = RealtimeHub::new(store.clone(), Duration::from_secs(30));
        let owner = AuthContext::for_key(DeviceKeypair::generate().public_key());
        let member = AuthContext::for_key(DeviceKeypair::generate().public_key());
        let vault_id = VaultId::new();
        store
            .create_vault(NewVault {
                id: vault_id,
                owner: owner.pubkey_hash,
                encrypted_vault_key: vec![1],
                enc_public_key: None,
                genesis_data: vec![],
                genesis_hlc: HlcTimestamp::ZERO,
            })
            .unwrap();
        store
            .insert_membership(VaultMembership {
                vault_id,
                pubkey_hash: member.pubkey_hash,
                role: Role::Member,
                encrypted_vault_key: Some(vec![2]),
                enc_public_key: None,
                key_epoch: 0,
                joined_at: 1_000,
            })
            .unwrap();
        Fixture {
            clock,
            store,
            hub,
            vault_id,
            owner,
            member,
        }
    }

    fn append(f: &Fixture, author: &AuthContext, physical: u64) -> VaultUpdate {
        f.store
            .append_update(NewUpdate {
                vault_id: f.vault_id,
                author: author.pubkey_hash,
                base_snapshot_version: 0,
                hlc_timestamp: HlcTimestamp::new(physical, 0, 0),
                key_epoch: 0,
                encrypted_data: vec![physical as u8],
            })
            .unwrap()
    }

    fn drain(sub: &mut Subscription) -> Vec<RealtimeEvent> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    fn update_ids(events: &[RealtimeEvent]) -> Vec<u64> {
        events.iter().filter_map(RealtimeEvent::update_id).collect()
    }

    #[test]
    fn non_member_cannot_subscribe() {
        let f = fixture();
        let stranger = AuthContext::for_key(DeviceKeypair::generate().public_key());
        assert!(matches!(
            f.hub.subscribe(&stranger, &f.vault_id),
            Err(ServerError::NotFound(_))
        ));
        assert_eq!(f.hub.subscriber_count(&f.vault_id), 0);
    }

    #[test]
    fn lifecycle_ends_in_unsubscribed() {
        let f = fixture();
        let mut sub = f.hub.subscribe(&f.member, &f.vault_id).unwrap();
        assert_eq!(sub.state(), SubscriptionState::Subscribed);
        assert!(sub.heartbeat());

        sub.unsubscribe();
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
        assert_eq!(f.hub.subscriber_count(&f.vault_id), 0);
        append(&f, &f.owner, 10);
        assert!(sub.try_recv().is_none());
        assert!(!sub.heartbeat());
        sub.unsubscribe();
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    }

    #[test]
    fn subscribe_broadcasts_presence() {
        let f = fixture();
        let mut a = f.hub.subscribe(&f.owner, &f.vault_id).unwrap();
        assert_eq!(a.state(), SubscriptionState::Subscribed);
        let _b = f.hub.subscribe(&f.member, &f.vault_id).unwrap();

        let events = drain(&mut a);
        let Some(RealtimeEvent::PresenceSync(last)) = events.last() else {
            panic!("expected presence, got {events:?}");
        };
        assert_eq!(last.len(), 2);
        assert_eq!(f.hub.presence(&f.vault_id).len(), 2);
    }

    #[test]
    fn updates_fan_out_to_every_subscriber() {
        let f = fixture();
        let mut a = f.hub.subscribe(&f.owner, &f.vault_id).unwrap();
        let mut b = f.hub.subscribe(&f.member, &f.vault_id).unwrap();
        let u1 = append(&f, &f.owner, 10);
        let u2 = append(&f, &f.member, 11);

        assert_eq!(update_ids(&drain(&mut a)), vec![u1.id, u2.id]);
        assert_eq!(update_ids(&drain(&mut b)), vec![u1.id, u2.id]);
    }

    #[test]
    fn unsubscribe_is_immediate_and_idempotent() {
        let f = fixture();
        let mut a = f.hub.subscribe(&f.owner, &f.vault_id).unwrap();
        let mut b = f.hub.subscribe(&f.member, &f.vault_id).unwrap();
        drain(&mut a);
        append(&f, &f.owner, 10);

        b.unsubscribe();
        b.unsubscribe();
        assert_eq!(b.state(), SubscriptionState::Unsubscribed);
        assert!(b.try_recv().is_none());
        assert_eq!(f.hub.subscriber_count(&f.vault_id), 1);

        let events = drain(&mut a);
        assert!(matches!(
            events.last(),
            Some(RealtimeEvent::PresenceSync(p)) if p.len() == 1
        ));
    }

    #[test]
    fn dropping_a_subscription_releases_it() {
        let f = fixture();
        let a = f.hub.subscribe(&f.owner, &f.vault_id).unwrap();
        assert_eq!(f.hub.subscriber_count(&f.vault_id), 1);
        drop(a);
        assert_eq!(f.hub.subscriber_count(&f.vault_id), 0);
    }

    #[test]
    fn removed_member_is_evicted() {
        let f = fixture();
        let mut a = f.hub.subscribe(&f.owner, &f.vault_id).unwrap();
        let mut b = f.hub.subscribe(&f.member, &f.vault_id).unwrap();
        f.store
            .delete_membership(&f.vault_id, &f.member.pubkey_hash)
            .unwrap();
        append(&f, &f.owner, 10);

        assert!(update_ids(&drain(&mut b)).is_empty());
        assert_eq!(b.state(), SubscriptionState::Unsubscribed);
        assert_eq!(update_ids(&drain(&mut a)).len(), 1);
    }

    #[test]
    fn deleted_vault_closes_subscriptions() {
        let f = fixture();
        let mut a = f.hub.subscribe(&f.owner, &f.vault_id).unwrap();
        f.store.delete_vault(&f.vault_id).unwrap();
        drain(&mut a);
        assert_eq!(a.state(), SubscriptionState::Unsubscribed);
        assert_eq!(f.hub.subscriber_count(&f.vault_id), 0);
    }

    #[test]
    fn stale_presence_is_swept() {
        let f = fixture();
        let mut a = f.hub.subscribe(&f.owner, &f.vault_id).unwrap();
        let mut b = f.hub.subscribe(&f.member, &f.vault_id).unwrap();

        f.clock.advance(20_000);
        assert!(a.heartbeat());
        f.clock.advance(15_000);
        assert_eq!(f.hub.sweep_stale_presence(), 1);

        drain(&mut b);
        assert_eq!(b.state(), SubscriptionState::Unsubscribed);
        assert!(!b.heartbeat());
        let presence = f.hub.presence(&f.vault_id);
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].user_id, f.owner.pubkey_hash);
        assert_eq!(presence[0].last_seen, 21_000);
    }

    #[tokio::test]
    async fn recv_waits_for_the_next_update() {
        let f = fixture();
        let mut a = f.hub.subscribe(&f.owner, &f.vault_id).unwrap();
        drain(&mut a);

        let store = f.store.clone();
        let vault_id = f.vault_id;
        let author = f.member.pubkey_hash;
        let writer = tokio::spawn(async move {
            store
                .append_update(NewUpdate {
                    vault_id,
                    author,
                    base_snapshot_version: 0,
                    hlc_timestamp: HlcTimestamp::new(5, 0, 0),
                    key_epoch: 0,
                    encrypted_data: vec![5],
                })
                .unwrap()
        });
        let event = a.recv().await.unwrap();
        let update = writer.await.unwrap();
        assert_eq!(event.update_id(), Some(update.id));
    }
}
