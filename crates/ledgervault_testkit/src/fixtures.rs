//! Test fixtures and server helpers.
//!
//! [`TestServer`] runs a [`VaultServer`] on a [`ManualClock`] and signs
//! calls on behalf of [`TestDevice`]s, so tests exercise the full request
//! path: signing, authentication, CBOR bodies and error mapping.

use ledgervault_protocol::http::realtime_path;
use ledgervault_protocol::signing::invite_accept_payload;
use ledgervault_protocol::{
    from_cbor, to_cbor, AcceptInviteRequest, AcceptInviteResponse, AppendUpdateRequest,
    AppendUpdateResponse, Clock, CreateInviteRequest, CreateInviteResponse, CreateVaultRequest,
    CreateVaultResponse, DeviceKeypair, ErrorBody, ErrorKind, FetchSinceRequest,
    FetchSinceResponse, HlcTimestamp, HttpRequest, ListMembersResponse, ManualClock, MemberInfo,
    PubkeyHash, Role, RpcOperation, SignedHeaders, VaultId, VaultInvite, VaultMembership,
    VaultRequest,
};
use ledgervault_server::{AuthContext, ServerConfig, ServerResult, Subscription, VaultServer};
use ledgervault_store::{StoreConfig, VaultStore};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Clock start for test servers, 2023-11-14T22:13:20Z.
pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

/// Default invite lifetime used by the helpers.
pub const TEST_INVITE_TTL_MS: u64 = 60 * 60 * 1000;

/// A device identity with a stand-in key-encapsulation public key.
#[derive(Debug)]
pub struct TestDevice {
    /// Signing identity.
    pub keypair: DeviceKeypair,
    /// Opaque 32-byte key-encapsulation public key.
    pub enc_public_key: Vec<u8>,
}

impl TestDevice {
    /// Creates a device with fresh keys.
    pub fn generate() -> Self {
        let mut enc_public_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut enc_public_key);
        Self {
            keypair: DeviceKeypair::generate(),
            enc_public_key,
        }
    }

    /// Identity hash.
    pub fn pubkey_hash(&self) -> PubkeyHash {
        self.keypair.pubkey_hash()
    }

    /// Pre-authenticated context for calling components directly.
    pub fn ctx(&self) -> AuthContext {
        AuthContext::for_key(self.keypair.public_key())
    }

    /// A wrapped-key stand-in unique to this device and epoch.
    pub fn wrapped_key(&self, key_epoch: u32) -> Vec<u8> {
        let mut key = self.pubkey_hash().as_bytes()[..8].to_vec();
        key.extend_from_slice(&key_epoch.to_be_bytes());
        key
    }
}

/// An in-process server with a pinned clock and automatic cleanup.
pub struct TestServer {
    /// The server instance.
    pub server: VaultServer,
    /// The shared clock.
    pub clock: Arc<ManualClock>,
    config: ServerConfig,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestServer {
    /// Creates a server over an in-memory store.
    pub fn memory() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates an in-memory server with a custom configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let store = VaultStore::open_in_memory(clock.clone()).expect("Failed to open in-memory store");
        Self {
            server: VaultServer::new(config.clone(), Arc::new(store)),
            clock,
            config,
            _temp_dir: None,
        }
    }

    /// Creates a server over a file-backed store in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let server = Self::open_dir(temp_dir.path(), &clock, ServerConfig::default());
        Self {
            server,
            clock,
            config: ServerConfig::default(),
            _temp_dir: Some(temp_dir),
        }
    }

    fn open_dir(path: &Path, clock: &Arc<ManualClock>, config: ServerConfig) -> VaultServer {
        let store = VaultStore::open(&path.join("store"), &StoreConfig::default(), clock.clone())
            .expect("Failed to open file store");
        VaultServer::new(config, Arc::new(store))
    }

    /// Drops the server and reopens its file-backed store.
    pub fn reopen(self) -> Self {
        let Self {
            server,
            clock,
            config,
            _temp_dir,
        } = self;
        let temp_dir = _temp_dir.expect("Only file-backed servers can be reopened");
        drop(server);
        let server = Self::open_dir(temp_dir.path(), &clock, config.clone());
        Self {
            server,
            clock,
            config,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Store directory if file-backed.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("store"))
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<VaultStore> {
        self.server.store()
    }

    /// Current clock reading.
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Moves the clock forward.
    pub fn advance(&self, millis: u64) {
        self.clock.advance(millis);
    }

    /// Builds a signed request for an operation.
    pub fn request<T: Serialize>(&self, device: &TestDevice, operation: RpcOperation, body: &T) -> HttpRequest {
        let body = to_cbor(body).expect("Failed to encode request body");
        signed_request(&device.keypair, "POST", &operation.path(), body, self.now())
    }

    /// Sends a signed call and decodes the reply or the error body.
    pub fn call<Req, Resp>(&self, device: &TestDevice, operation: RpcOperation, body: &Req) -> Result<Resp, ErrorBody>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self.server.handle(&self.request(device, operation, body));
        if response.is_success() {
            Ok(from_cbor(&response.body).expect("Failed to decode response body"))
        } else {
            Err(from_cbor(&response.body).unwrap_or(ErrorBody {
                kind: ErrorKind::from_http_status(response.status),
                message: String::new(),
            }))
        }
    }

    /// Subscribes through the realtime route.
    pub fn subscribe(&self, device: &TestDevice, vault_id: VaultId) -> ServerResult<Subscription> {
        let request = signed_request(&device.keypair, "GET", &realtime_path(&vault_id), Vec::new(), self.now());
        self.server.subscribe(&request)
    }

    /// Creates a vault owned by `owner` and returns its id.
    pub fn create_vault(&self, owner: &TestDevice) -> VaultId {
        let vault_id = VaultId::new();
        let _: CreateVaultResponse = self
            .call(
                owner,
                RpcOperation::CreateVault,
                &CreateVaultRequest {
                    vault_id,
                    encrypted_vault_key: owner.wrapped_key(0),
                    enc_public_key: Some(owner.enc_public_key.clone()),
                    genesis_data: Vec::new(),
                    genesis_hlc: HlcTimestamp::ZERO,
                },
            )
            .expect("Failed to create vault");
        vault_id
    }

    /// Creates an invite and returns it with its secret key.
    pub fn invite(
        &self,
        inviter: &TestDevice,
        vault_id: VaultId,
        role: Role,
    ) -> Result<(VaultInvite, DeviceKeypair), ErrorBody> {
        let invite_key = DeviceKeypair::generate();
        let response: CreateInviteResponse = self.call(
            inviter,
            RpcOperation::CreateInvite,
            &CreateInviteRequest {
                vault_id,
                invite_pubkey: invite_key.public_key(),
                encrypted_vault_key: vec![0x1e; 16],
                role,
                ttl_ms: TEST_INVITE_TTL_MS,
            },
        )?;
        Ok((response.invite, invite_key))
    }

    /// Accepts an invite as `invitee`.
    pub fn accept(
        &self,
        invitee: &TestDevice,
        invite: &VaultInvite,
        invite_key: &DeviceKeypair,
    ) -> Result<VaultMembership, ErrorBody> {
        let payload = invite_accept_payload(&invite.id.to_string(), &invitee.pubkey_hash());
        let key_epoch = self.store().vault(&invite.vault_id).map_or(0, |v| v.key_epoch);
        let response: AcceptInviteResponse = self.call(
            invitee,
            RpcOperation::AcceptInvite,
            &AcceptInviteRequest {
                invite_id: invite.id,
                invite_signature: invite_key.sign(&payload).to_vec(),
                encrypted_vault_key: invitee.wrapped_key(key_epoch),
                enc_public_key: Some(invitee.enc_public_key.clone()),
            },
        )?;
        Ok(response.membership)
    }

    /// Invites and accepts in one step.
    pub fn join(&self, owner: &TestDevice, vault_id: VaultId, invitee: &TestDevice) -> VaultMembership {
        let (invite, invite_key) = self
            .invite(owner, vault_id, Role::Member)
            .expect("Failed to create invite");
        self.accept(invitee, &invite, &invite_key)
            .expect("Failed to accept invite")
    }

    /// Appends an update on snapshot 0 under the vault's current key epoch.
    pub fn append(
        &self,
        device: &TestDevice,
        vault_id: VaultId,
        hlc: HlcTimestamp,
        data: &[u8],
    ) -> Result<AppendUpdateResponse, ErrorBody> {
        let key_epoch = self.store().vault(&vault_id).map_or(0, |v| v.key_epoch);
        self.call(
            device,
            RpcOperation::AppendUpdate,
            &AppendUpdateRequest {
                vault_id,
                base_snapshot_version: 0,
                hlc_timestamp: hlc,
                key_epoch,
                encrypted_data: data.to_vec(),
            },
        )
    }

    /// Fetches from a snapshot version.
    pub fn fetch(&self, device: &TestDevice, request: &FetchSinceRequest) -> Result<FetchSinceResponse, ErrorBody> {
        self.call(device, RpcOperation::FetchSince, request)
    }

    /// Lists members.
    pub fn members(&self, device: &TestDevice, vault_id: VaultId) -> Result<Vec<MemberInfo>, ErrorBody> {
        let response: ListMembersResponse =
            self.call(device, RpcOperation::ListMembers, &VaultRequest { vault_id })?;
        Ok(response.members)
    }
}

impl std::ops::Deref for TestServer {
    type Target = VaultServer;

    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

/// Builds a request signed at `timestamp_ms`.
pub fn signed_request(
    keypair: &DeviceKeypair,
    method: &str,
    path: &str,
    body: Vec<u8>,
    timestamp_ms: u64,
) -> HttpRequest {
    let headers = SignedHeaders::sign(keypair, method, path, &body, timestamp_ms);
    HttpRequest::new(method, path, body).with_headers(headers.into_pairs())
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A vault with an owner and members.
    pub struct TestVault {
        /// Vault id.
        pub id: VaultId,
        /// Owner device.
        pub owner: TestDevice,
        /// Member devices, in join order.
        pub members: Vec<TestDevice>,
    }

    /// Creates a vault with `member_count` members besides the owner.
    pub fn vault_with_members(server: &TestServer, member_count: usize) -> TestVault {
        let owner = TestDevice::generate();
        let id = server.create_vault(&owner);
        let members = (0..member_count)
            .map(|_| {
                let device = TestDevice::generate();
                server.join(&owner, id, &device);
                device
            })
            .collect();
        TestVault { id, owner, members }
    }
}
