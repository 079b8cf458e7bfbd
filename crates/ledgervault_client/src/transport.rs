//! Transport abstraction between the client and a vault server.

use crate::error::{ClientError, ClientResult};
use ledgervault_protocol::{HttpRequest, HttpResponse, RealtimeEvent, VaultId};
use ledgervault_server::{Subscription, VaultServer};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};

/// Carries signed requests to a server.
///
/// Implementations map network faults to [`ClientError::Transport`]; a
/// reply with a non-2xx status is still `Ok`.
pub trait VaultTransport: Send + Sync {
    /// Sends an RPC request and returns the raw response.
    fn send(&self, request: &HttpRequest) -> ClientResult<HttpResponse>;

    /// Opens a realtime subscription.
    fn subscribe(&self, request: &HttpRequest) -> ClientResult<RealtimeStream>;
}

/// A source of realtime events for one subscription.
pub trait EventSource: Send {
    /// Polls for the next event. `Ready(None)` means the subscription ended.
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<RealtimeEvent>>;

    /// Returns a buffered event without waiting.
    fn try_event(&mut self) -> Option<RealtimeEvent>;

    /// Refreshes presence. Returns false once the subscription is gone.
    fn heartbeat(&mut self) -> bool;

    /// Ends the subscription.
    fn close(&mut self);
}

impl EventSource for Subscription {
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<RealtimeEvent>> {
        self.poll_recv(cx)
    }

    fn try_event(&mut self) -> Option<RealtimeEvent> {
        self.try_recv()
    }

    fn heartbeat(&mut self) -> bool {
        Subscription::heartbeat(self)
    }

    fn close(&mut self) {
        self.unsubscribe();
    }
}

/// Realtime events for one vault.
pub struct RealtimeStream {
    vault_id: VaultId,
    source: Box<dyn EventSource>,
}

impl RealtimeStream {
    /// Wraps an event source.
    pub fn new(vault_id: VaultId, source: impl EventSource + 'static) -> Self {
        Self {
            vault_id,
            source: Box::new(source),
        }
    }

    /// Subscribed vault.
    pub fn vault_id(&self) -> &VaultId {
        &self.vault_id
    }

    /// Waits for the next event. Returns `None` once the subscription has
    /// ended (unsubscribed, removed from the vault, or vault deleted).
    pub async fn next(&mut self) -> Option<RealtimeEvent> {
        std::future::poll_fn(|cx| self.source.poll_event(cx)).await
    }

    /// Returns a buffered event without waiting.
    pub fn try_next(&mut self) -> Option<RealtimeEvent> {
        self.source.try_event()
    }

    /// Refreshes presence.
    pub fn heartbeat(&mut self) -> bool {
        self.source.heartbeat()
    }

    /// Unsubscribes. Idempotent.
    pub fn close(&mut self) {
        self.source.close();
    }
}

impl Drop for RealtimeStream {
    fn drop(&mut self) {
        self.source.close();
    }
}

impl fmt::Debug for RealtimeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeStream")
            .field("vault_id", &self.vault_id)
            .finish_non_exhaustive()
    }
}

/// Calls an in-process [`VaultServer`].
///
/// Used by tests and by tools embedding the server. Faults can be injected
/// to exercise retry paths: a dropped request never reaches the server, a
/// lost reply is handled by the server but not returned.
#[derive(Debug)]
pub struct LoopbackTransport {
    server: VaultServer,
    connected: AtomicBool,
    drop_requests: AtomicU32,
    lose_replies: AtomicU32,
    delivered: AtomicU64,
}

impl LoopbackTransport {
    /// Creates a transport over `server`.
    pub fn new(server: VaultServer) -> Self {
        Self {
            server,
            connected: AtomicBool::new(true),
            drop_requests: AtomicU32::new(0),
            lose_replies: AtomicU32::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// The wrapped server.
    pub fn server(&self) -> &VaultServer {
        &self.server
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Drops the next `count` requests before they reach the server.
    pub fn drop_next_requests(&self, count: u32) {
        self.drop_requests.store(count, Ordering::SeqCst);
    }

    /// Handles the next `count` requests but loses their replies.
    pub fn lose_next_replies(&self, count: u32) {
        self.lose_replies.store(count, Ordering::SeqCst);
    }

    /// Requests that reached the server.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_connected(&self) -> ClientResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::transport_retryable("not connected"))
        }
    }
}

impl VaultTransport for LoopbackTransport {
    fn send(&self, request: &HttpRequest) -> ClientResult<HttpResponse> {
        self.check_connected()?;
        if Self::take(&self.drop_requests) {
            return Err(ClientError::transport_retryable("request dropped"));
        }
        let response = self.server.handle(request);
        self.delivered.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.lose_replies) {
            return Err(ClientError::transport_retryable("reply lost"));
        }
        Ok(response)
    }

    fn subscribe(&self, request: &HttpRequest) -> ClientResult<RealtimeStream> {
        self.check_connected()?;
        let subscription = self.server.subscribe(request)?;
        Ok(RealtimeStream::new(*subscription.vault_id(), subscription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgervault_protocol::ManualClock;
    use ledgervault_server::ServerConfig;
    use ledgervault_store::VaultStore;
    use std::sync::Arc;

    fn transport() -> LoopbackTransport {
        let store = VaultStore::open_in_memory(Arc::new(ManualClock::new(1_000))).unwrap();
        LoopbackTransport::new(VaultServer::new(ServerConfig::default(), Arc::new(store)))
    }

    #[test]
    fn disconnected_transport_is_retryable() {
        let transport = transport();
        transport.set_connected(false);
        let err = transport
            .send(&HttpRequest::new("POST", "/rpc/user.get", vec![]))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.delivered(), 0);
    }

    #[test]
    fn injected_faults_are_consumed() {
        let transport = transport();
        let request = HttpRequest::new("POST", "/rpc/user.get", vec![]);

        transport.drop_next_requests(1);
        assert!(transport.send(&request).is_err());
        assert_eq!(transport.delivered(), 0);

        transport.lose_next_replies(1);
        assert!(transport.send(&request).is_err());
        assert_eq!(transport.delivered(), 1);

        let response = transport.send(&request).unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(transport.delivered(), 2);
    }
}
