//! Request signing.

use crate::error::ClientResult;
use ledgervault_protocol::http::realtime_path;
use ledgervault_protocol::{
    to_cbor, Clock, DeviceKeypair, HttpRequest, PubkeyHash, RpcOperation, SignedHeaders, VaultId,
};
use serde::Serialize;
use std::sync::Arc;

/// Signs outgoing requests with the device key.
pub struct RequestSigner {
    keypair: DeviceKeypair,
    clock: Arc<dyn Clock>,
}

impl RequestSigner {
    /// Creates a signer.
    pub fn new(keypair: DeviceKeypair, clock: Arc<dyn Clock>) -> Self {
        Self { keypair, clock }
    }

    /// The device key.
    pub fn keypair(&self) -> &DeviceKeypair {
        &self.keypair
    }

    /// The device identity.
    pub fn pubkey_hash(&self) -> PubkeyHash {
        self.keypair.pubkey_hash()
    }

    /// The wall clock used for signature timestamps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Signs a raw request at the current time.
    pub fn sign(&self, method: &str, path: &str, body: Vec<u8>) -> HttpRequest {
        let headers = SignedHeaders::sign(&self.keypair, method, path, &body, self.clock.now_millis());
        HttpRequest::new(method, path, body).with_headers(headers.into_pairs())
    }

    /// Encodes and signs an RPC call.
    pub fn rpc<T: Serialize>(&self, operation: RpcOperation, body: &T) -> ClientResult<HttpRequest> {
        Ok(self.sign("POST", &operation.path(), to_cbor(body)?))
    }

    /// Signs a realtime subscription request.
    pub fn realtime(&self, vault_id: &VaultId) -> HttpRequest {
        self.sign("GET", &realtime_path(vault_id), Vec::new())
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("pubkey_hash", &self.keypair.pubkey_hash())
            .finish_non_exhaustive()
    }
}
