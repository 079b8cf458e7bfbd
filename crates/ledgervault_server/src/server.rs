//! RPC dispatcher.

use crate::accounts::Accounts;
use crate::auth::{AuthContext, RequestAuthenticator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::membership::MembershipCoordinator;
use crate::realtime::{RealtimeHub, Subscription};
use crate::sync::SyncLog;
use ledgervault_protocol::http::REALTIME_PREFIX;
use ledgervault_protocol::{
    from_cbor, to_cbor, Ack, AcceptInviteRequest, AcceptInviteResponse, AppendUpdateRequest,
    CreateInviteRequest, CreateInviteResponse, CreateVaultRequest, CreateVaultResponse,
    FetchSinceRequest, HttpRequest, HttpResponse, ListInvitesResponse, ListMembersResponse,
    PutUserDataRequest, RekeyRequest, RekeyResponse, RemoveMemberRequest,
    RemoveMemberResponse, RpcOperation, UserDataResponse, VaultId, VaultRequest,
};
use ledgervault_store::VaultStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// The vault server.
///
/// Wires the authenticator, sync log, membership coordinator, accounts and
/// realtime hub around one store. Transports hand it [`HttpRequest`]s and
/// send back the [`HttpResponse`]s it produces.
///
/// # Example
///
/// ```
/// use ledgervault_protocol::{SystemClock, HttpRequest, ErrorKind};
/// use ledgervault_server::{ServerConfig, VaultServer};
/// use ledgervault_store::VaultStore;
/// use std::sync::Arc;
///
/// let store = Arc::new(VaultStore::open_in_memory(Arc::new(SystemClock)).unwrap());
/// let server = VaultServer::new(ServerConfig::default(), store);
///
/// // Unsigned requests are rejected before routing.
/// let response = server.handle(&HttpRequest::new("POST", "/rpc/vault.create", vec![]));
/// assert_eq!(response.status, ErrorKind::Unauthorized.http_status());
/// ```
#[derive(Debug, Clone)]
pub struct VaultServer {
    config: Arc<ServerConfig>,
    store: Arc<VaultStore>,
    authenticator: RequestAuthenticator,
    sync: SyncLog,
    membership: MembershipCoordinator,
    accounts: Accounts,
    hub: RealtimeHub,
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> ServerResult<T> {
    Ok(from_cbor(body)?)
}

fn encode<T: Serialize>(value: &T) -> ServerResult<Vec<u8>> {
    to_cbor(value).map_err(|e| ServerError::Internal(e.to_string()))
}

impl VaultServer {
    /// Creates a server over a store. Installs the realtime hub as the
    /// store's commit listener.
    pub fn new(config: ServerConfig, store: Arc<VaultStore>) -> Self {
        let config = Arc::new(config);
        let authenticator = RequestAuthenticator::new(config.auth.clone(), store.clock().clone());
        Self {
            sync: SyncLog::new(store.clone(), config.clone()),
            membership: MembershipCoordinator::new(store.clone(), config.clone()),
            accounts: Accounts::new(store.clone()),
            hub: RealtimeHub::new(store.clone(), config.presence_timeout),
            authenticator,
            store,
            config,
        }
    }

    /// Handles one RPC call. Never fails; errors become an [`ErrorBody`]
    /// response.
    ///
    /// [`ErrorBody`]: ledgervault_protocol::ErrorBody
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        match self.dispatch(request) {
            Ok(body) => HttpResponse { status: 200, body },
            Err(err) => self.error_response(request, &err),
        }
    }

    fn error_response(&self, request: &HttpRequest, err: &ServerError) -> HttpResponse {
        if err.is_server_error() {
            warn!(path = %request.path, error = %err, "request failed");
        } else {
            debug!(path = %request.path, error = %err, "request rejected");
        }
        let body = err.to_body(self.config.expose_error_details);
        HttpResponse {
            status: err.http_status(),
            // ErrorBody encoding does not fail in practice.
            body: to_cbor(&body).unwrap_or_default(),
        }
    }

    fn dispatch(&self, request: &HttpRequest) -> ServerResult<Vec<u8>> {
        let ctx = self.authenticator.authenticate(request)?;
        let operation = RpcOperation::from_path(&request.path)
            .ok_or_else(|| ServerError::NotFound(format!("no route for {}", request.path)))?;
        if !request.method.eq_ignore_ascii_case("POST") {
            return Err(ServerError::BadRequest(format!(
                "{operation} expects POST, got {}",
                request.method
            )));
        }
        debug!(operation = %operation, caller = %ctx.pubkey_hash.short(), "dispatching");
        self.call(&ctx, operation, &request.body)
    }

    fn call(&self, ctx: &AuthContext, operation: RpcOperation, body: &[u8]) -> ServerResult<Vec<u8>> {
        match operation {
            RpcOperation::CreateVault => {
                let request: CreateVaultRequest = decode(body)?;
                let vault = self.membership.create_vault(ctx, request)?;
                encode(&CreateVaultResponse { vault })
            }
            RpcOperation::DeleteVault => {
                let request: VaultRequest = decode(body)?;
                self.membership.delete_vault(ctx, &request.vault_id)?;
                encode(&Ack::OK)
            }
            RpcOperation::ListMembers => {
                let request: VaultRequest = decode(body)?;
                let members = self.sync.list_members(ctx, &request.vault_id)?;
                encode(&ListMembersResponse { members })
            }
            RpcOperation::GetMembership => {
                let request: VaultRequest = decode(body)?;
                encode(&self.membership.own_membership(ctx, &request.vault_id)?)
            }
            RpcOperation::RemoveMember => {
                let request: RemoveMemberRequest = decode(body)?;
                let remaining = self
                    .membership
                    .remove(ctx, &request.vault_id, &request.target)?;
                encode(&RemoveMemberResponse { remaining })
            }
            RpcOperation::Rekey => {
                let request: RekeyRequest = decode(body)?;
                let key_epoch = self
                    .membership
                    .rekey(ctx, &request.vault_id, request.member_keys)?;
                encode(&RekeyResponse { key_epoch })
            }
            RpcOperation::LeaveVault => {
                let request: VaultRequest = decode(body)?;
                self.membership.leave(ctx, &request.vault_id)?;
                encode(&Ack::OK)
            }
            RpcOperation::CreateInvite => {
                let request: CreateInviteRequest = decode(body)?;
                let invite = self.membership.create_invite(ctx, request)?;
                encode(&CreateInviteResponse { invite })
            }
            RpcOperation::AcceptInvite => {
                let request: AcceptInviteRequest = decode(body)?;
                let membership = self.membership.accept_invite(ctx, request)?;
                encode(&AcceptInviteResponse { membership })
            }
            RpcOperation::ListInvites => {
                let request: VaultRequest = decode(body)?;
                let invites = self.membership.list_invites(ctx, &request.vault_id)?;
                encode(&ListInvitesResponse { invites })
            }
            RpcOperation::AppendUpdate => {
                let request: AppendUpdateRequest = decode(body)?;
                encode(&self.sync.append_update(ctx, request)?)
            }
            RpcOperation::FetchSince => {
                let request: FetchSinceRequest = decode(body)?;
                encode(&self.sync.fetch_since(ctx, &request)?)
            }
            RpcOperation::PutUserData => {
                let request: PutUserDataRequest = decode(body)?;
                self.accounts.put_user_data(ctx, request)?;
                encode(&Ack::OK)
            }
            RpcOperation::GetUserData => {
                let user_data = self.accounts.get_user_data(ctx)?;
                encode(&UserDataResponse { user_data })
            }
        }
    }

    /// Serves `GET /realtime/{vault_id}`.
    pub fn subscribe(&self, request: &HttpRequest) -> ServerResult<Subscription> {
        let ctx = self.authenticator.authenticate(request)?;
        if !request.method.eq_ignore_ascii_case("GET") {
            return Err(ServerError::BadRequest("realtime subscriptions use GET".into()));
        }
        let vault_id: VaultId = request
            .path
            .strip_prefix(REALTIME_PREFIX)
            .ok_or_else(|| ServerError::NotFound(format!("no route for {}", request.path)))?
            .parse()
            .map_err(|_| ServerError::BadRequest("malformed vault id".into()))?;
        self.hub.subscribe(&ctx, &vault_id)
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<VaultStore> {
        &self.store
    }

    /// Request authenticator.
    pub fn authenticator(&self) -> &RequestAuthenticator {
        &self.authenticator
    }

    /// Sync log, including out-of-band compaction.
    pub fn sync(&self) -> &SyncLog {
        &self.sync
    }

    /// Membership coordinator.
    pub fn membership(&self) -> &MembershipCoordinator {
        &self.membership
    }

    /// Realtime hub.
    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }
}
