//! High-level vault client.

use crate::config::ClientConfig;
use crate::crypto::{
    sealed_epoch, unwrap_vault_keys, wrap_vault_keys, EncryptionKeypair, KeyRing, VaultKey,
};
use crate::error::{ClientError, ClientResult};
use crate::hlc::HybridClock;
use crate::invite::{invite_encryption_key, InviteTicket};
use crate::replay::{Replica, UpdateApplier};
use crate::signer::RequestSigner;
use crate::transport::{RealtimeStream, VaultTransport};
use ledgervault_protocol::signing::invite_accept_payload;
use ledgervault_protocol::{
    from_cbor, AcceptInviteRequest, AcceptInviteResponse, Ack, AppendUpdateRequest,
    AppendUpdateResponse, Clock, CreateInviteRequest, CreateInviteResponse, CreateVaultRequest,
    CreateVaultResponse, DeviceKeypair, ErrorBody, ErrorKind, FetchSinceRequest,
    FetchSinceResponse, HttpResponse, ListMembersResponse, MemberInfo, MemberKey,
    MembershipResponse, PubkeyHash, PutUserDataRequest, RealtimeEvent, RekeyRequest,
    RekeyResponse, RekeyTarget, RemoveMemberRequest, RemoveMemberResponse, Role, RpcOperation,
    UserData, UserDataResponse, Vault, VaultId, VaultMembership, VaultRequest,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`VaultClient::sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Pages fetched.
    pub pages: usize,
    /// Updates newly applied.
    pub applied: usize,
    /// Updates skipped as already known.
    pub skipped: usize,
    /// Updates sealed under an epoch this device never received.
    pub unreadable: usize,
    /// Whether the replica moved to a newer snapshot.
    pub reloaded: bool,
}

/// A device's view of the vaults it belongs to.
///
/// Holds the device's signing and encryption keys plus the vault keys it
/// has unwrapped, and drives every flow over a [`VaultTransport`].
pub struct VaultClient<T> {
    config: ClientConfig,
    transport: T,
    signer: RequestSigner,
    encryption: EncryptionKeypair,
    hlc: HybridClock,
    keys: RwLock<HashMap<VaultId, KeyRing>>,
    /// Vaults whose server-side author head this clock has observed.
    heads_seen: RwLock<HashSet<VaultId>>,
    cancelled: AtomicBool,
}

impl<T: VaultTransport> VaultClient<T> {
    /// Creates a client for one device.
    pub fn new(
        config: ClientConfig,
        transport: T,
        keypair: DeviceKeypair,
        encryption: EncryptionKeypair,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let hash = keypair.pubkey_hash();
        let mut node = [0u8; 8];
        node.copy_from_slice(&hash.as_bytes()[..8]);
        Self {
            config,
            transport,
            hlc: HybridClock::new(clock.clone(), u64::from_be_bytes(node)),
            signer: RequestSigner::new(keypair, clock),
            encryption,
            keys: RwLock::new(HashMap::new()),
            heads_seen: RwLock::new(HashSet::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Device identity.
    pub fn pubkey_hash(&self) -> PubkeyHash {
        self.signer.pubkey_hash()
    }

    /// Public half of the device's encryption key.
    pub fn enc_public_key(&self) -> [u8; 32] {
        self.encryption.public_key()
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The device's HLC.
    pub fn hlc(&self) -> &HybridClock {
        &self.hlc
    }

    /// Vault keys held for `vault_id`.
    pub fn key_ring(&self, vault_id: &VaultId) -> Option<KeyRing> {
        self.keys.read().get(vault_id).cloned()
    }

    /// Cancels retry loops in progress.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears a previous [`VaultClient::cancel`].
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> ClientResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(ClientError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn store_key(&self, vault_id: VaultId, key_epoch: u32, key: VaultKey) {
        self.keys.write().entry(vault_id).or_default().insert(key_epoch, key);
    }

    fn store_ring(&self, vault_id: VaultId, ring: &KeyRing) {
        self.keys.write().entry(vault_id).or_default().merge(ring);
    }

    fn forget_vault(&self, vault_id: &VaultId) {
        self.keys.write().remove(vault_id);
        self.heads_seen.write().remove(vault_id);
    }

    fn call<Req, Resp>(&self, operation: RpcOperation, body: &Req) -> ClientResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let request = self.signer.rpc(operation, body)?;
        let response = self.transport.send(&request)?;
        decode_response(operation, &response)
    }

    /// Calls an idempotent operation, retrying retryable failures.
    fn call_with_retry<Req, Resp>(&self, operation: RpcOperation, body: &Req) -> ClientResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let retry = &self.config.retry;
        let attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            self.check_cancelled()?;
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
            }
            match self.call(operation, body) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    warn!(operation = %operation, attempt, error = %e, "retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates a vault owned by this device, with a fresh vault key.
    pub fn create_vault(&self) -> ClientResult<Vault> {
        let vault_id = VaultId::new();
        let key = VaultKey::generate();
        let request = CreateVaultRequest {
            vault_id,
            encrypted_vault_key: wrap_vault_keys(&key, &KeyRing::new(), &self.encryption.public_key())?,
            enc_public_key: Some(self.encryption.public_key().to_vec()),
            // The empty state needs no sealing.
            genesis_data: Vec::new(),
            genesis_hlc: self.hlc.now(),
        };
        let response: CreateVaultResponse = self.call(RpcOperation::CreateVault, &request)?;
        self.store_key(vault_id, response.vault.key_epoch, key);
        self.heads_seen.write().insert(vault_id);
        info!(vault_id = %vault_id, "vault created");
        Ok(response.vault)
    }

    /// Deletes a vault this device owns.
    pub fn delete_vault(&self, vault_id: &VaultId) -> ClientResult<()> {
        let _: Ack = self.call(RpcOperation::DeleteVault, &VaultRequest { vault_id: *vault_id })?;
        self.forget_vault(vault_id);
        Ok(())
    }

    /// Leaves a vault and drops its keys.
    pub fn leave(&self, vault_id: &VaultId) -> ClientResult<()> {
        let _: Ack = self.call(RpcOperation::LeaveVault, &VaultRequest { vault_id: *vault_id })?;
        self.forget_vault(vault_id);
        Ok(())
    }

    /// Lists the members of a vault.
    pub fn list_members(&self, vault_id: &VaultId) -> ClientResult<Vec<MemberInfo>> {
        let response: ListMembersResponse =
            self.call_with_retry(RpcOperation::ListMembers, &VaultRequest { vault_id: *vault_id })?;
        Ok(response.members)
    }

    /// Fetches this device's membership and unwraps its vault keys, current
    /// and retired. Returns the current key epoch.
    ///
    /// Also moves the HLC past the newest timestamp the server accepted from
    /// this device, so a restarted device does not reuse one.
    pub fn refresh_vault_key(&self, vault_id: &VaultId) -> ClientResult<u32> {
        let response: MembershipResponse =
            self.call_with_retry(RpcOperation::GetMembership, &VaultRequest { vault_id: *vault_id })?;
        self.adopt_membership(&response.membership)?;
        if let Some(head) = response.author_head {
            self.hlc.observe(head);
        }
        self.heads_seen.write().insert(*vault_id);
        Ok(response.membership.key_epoch)
    }

    fn adopt_membership(&self, membership: &VaultMembership) -> ClientResult<()> {
        let wrapped = membership
            .encrypted_vault_key
            .as_deref()
            .ok_or(ClientError::NoVaultKey {
                vault_id: membership.vault_id,
                key_epoch: membership.key_epoch,
            })?;
        let ring = unwrap_vault_keys(wrapped, membership.key_epoch, &self.encryption)?;
        self.store_ring(membership.vault_id, &ring);
        Ok(())
    }

    /// Returns the key ring, refreshing it from the server when it lacks
    /// `key_epoch` (or any key, if `None`).
    fn ring_with(&self, vault_id: &VaultId, key_epoch: Option<u32>) -> ClientResult<KeyRing> {
        let covered = |ring: &KeyRing| match key_epoch {
            Some(epoch) => ring.get(epoch).is_some(),
            None => !ring.is_empty(),
        };
        if let Some(ring) = self.key_ring(vault_id).filter(|r| covered(r)) {
            return Ok(ring);
        }
        debug!(vault_id = %vault_id, ?key_epoch, "refreshing vault key");
        self.refresh_vault_key(vault_id)?;
        self.key_ring(vault_id).ok_or(ClientError::NoVaultKey {
            vault_id: *vault_id,
            key_epoch: key_epoch.unwrap_or(0),
        })
    }

    /// Creates an invite and returns the ticket to hand to the invitee.
    pub fn invite(&self, vault_id: &VaultId, role: Role) -> ClientResult<InviteTicket> {
        let ring = self.ring_with(vault_id, None)?;
        let (key_epoch, key) = ring.current().ok_or(ClientError::NoVaultKey {
            vault_id: *vault_id,
            key_epoch: 0,
        })?;
        let invite_key = DeviceKeypair::generate();
        let invite_secret = invite_key.secret_bytes().to_vec();
        let invite_enc = invite_encryption_key(&invite_secret)?;
        let encrypted_vault_key = wrap_vault_keys(key, &ring, &invite_enc.public_key())?;

        let request = CreateInviteRequest {
            vault_id: *vault_id,
            invite_pubkey: invite_key.public_key(),
            encrypted_vault_key: encrypted_vault_key.clone(),
            role,
            ttl_ms: u64::try_from(self.config.invite_ttl.as_millis()).unwrap_or(u64::MAX),
        };
        let response: CreateInviteResponse = self.call(RpcOperation::CreateInvite, &request)?;
        Ok(InviteTicket {
            vault_id: *vault_id,
            invite_id: response.invite.id,
            key_epoch,
            invite_secret,
            encrypted_vault_key,
        })
    }

    /// Accepts an invite, re-wrapping the vault keys for this device.
    pub fn accept(&self, ticket: &InviteTicket) -> ClientResult<VaultMembership> {
        let invite_key = ticket.signing_key()?;
        let ring = unwrap_vault_keys(&ticket.encrypted_vault_key, ticket.key_epoch, &ticket.encryption_key()?)?;
        let key = ring.get(ticket.key_epoch).ok_or(ClientError::NoVaultKey {
            vault_id: ticket.vault_id,
            key_epoch: ticket.key_epoch,
        })?;
        let payload = invite_accept_payload(&ticket.invite_id.to_string(), &self.pubkey_hash());

        let request = AcceptInviteRequest {
            invite_id: ticket.invite_id,
            invite_signature: invite_key.sign(&payload).to_vec(),
            encrypted_vault_key: wrap_vault_keys(key, &ring, &self.encryption.public_key())?,
            enc_public_key: Some(self.encryption.public_key().to_vec()),
        };
        let response: AcceptInviteResponse = self.call(RpcOperation::AcceptInvite, &request)?;
        self.store_ring(ticket.vault_id, &ring);
        // A fresh member has no accepted timestamps yet.
        self.heads_seen.write().insert(ticket.vault_id);
        info!(vault_id = %ticket.vault_id, "joined vault");
        Ok(response.membership)
    }

    /// Seals and appends a delta on top of `base_snapshot_version`.
    ///
    /// Never retried: a lost reply leaves the outcome unknown, and sending
    /// again would append a second row. Callers resolve it with
    /// [`VaultClient::sync`].
    pub fn append(
        &self,
        vault_id: &VaultId,
        base_snapshot_version: u64,
        plaintext: &[u8],
    ) -> ClientResult<AppendUpdateResponse> {
        self.check_cancelled()?;
        if !self.heads_seen.read().contains(vault_id) {
            self.refresh_vault_key(vault_id)?;
        }
        let ring = self.ring_with(vault_id, None)?;
        let (key_epoch, encrypted_data) = ring.seal(vault_id, plaintext)?;
        let request = AppendUpdateRequest {
            vault_id: *vault_id,
            base_snapshot_version,
            hlc_timestamp: self.hlc.now(),
            key_epoch,
            encrypted_data,
        };
        let response: AppendUpdateResponse = self.call(RpcOperation::AppendUpdate, &request)?;
        debug!(vault_id = %vault_id, update_id = response.update_id, "update appended");
        Ok(response)
    }

    /// Fetches one page of the log.
    pub fn fetch(&self, request: &FetchSinceRequest) -> ClientResult<FetchSinceResponse> {
        self.call_with_retry(RpcOperation::FetchSince, request)
    }

    /// Brings `replica` up to date with the server's log.
    ///
    /// Reads every update after the replica's snapshot; ids already applied
    /// are skipped, so updates another author inserted earlier in the
    /// total order are still picked up.
    pub fn sync<A: UpdateApplier>(&self, replica: &mut Replica<A>) -> ClientResult<SyncSummary> {
        let vault_id = *replica.vault_id();
        let mut keys = EpochCache::new(self.ring_with(&vault_id, None)?);
        let mut summary = SyncSummary::default();
        let mut after = None;
        loop {
            self.check_cancelled()?;
            let mut request = FetchSinceRequest::new(vault_id, replica.snapshot_version())
                .with_limit(self.config.fetch_batch);
            request.after = after;
            let page = self.fetch(&request)?;
            summary.pages += 1;

            if let Ok(epoch) = sealed_epoch(&page.snapshot.encrypted_data) {
                keys.ensure(self, &vault_id, epoch)?;
            }
            if replica.load_snapshot(&page.snapshot, &keys.ring)? {
                summary.reloaded = true;
                if after.is_some() {
                    // The cursor belongs to the old snapshot; restart the walk
                    // from the new one.
                    debug!(vault_id = %vault_id, version = replica.snapshot_version(), "snapshot moved mid-sync");
                    after = None;
                    continue;
                }
            }

            for update in &page.updates {
                self.hlc.observe(update.hlc_timestamp);
                keys.ensure(self, &vault_id, update.key_epoch)?;
                match replica.apply_update(update, &keys.ring) {
                    Ok(true) => summary.applied += 1,
                    Ok(false) => summary.skipped += 1,
                    // Sealed under an epoch this device was never given.
                    Err(ClientError::NoVaultKey { key_epoch, .. }) => {
                        warn!(vault_id = %vault_id, update_id = update.id, key_epoch, "update unreadable");
                        summary.unreadable += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            match page.updates.last() {
                Some(last) if page.has_more => after = Some(last.position()),
                _ => break,
            }
        }
        debug!(
            vault_id = %vault_id,
            pages = summary.pages,
            applied = summary.applied,
            "replica synced"
        );
        Ok(summary)
    }

    /// Opens a realtime subscription for a vault.
    pub fn subscribe(&self, vault_id: &VaultId) -> ClientResult<RealtimeStream> {
        self.transport.subscribe(&self.signer.realtime(vault_id))
    }

    /// Applies a realtime event to `replica`. Returns true if an update was
    /// newly applied.
    pub fn apply_event<A: UpdateApplier>(
        &self,
        replica: &mut Replica<A>,
        event: &RealtimeEvent,
    ) -> ClientResult<bool> {
        match event {
            RealtimeEvent::UpdateInserted(notification) => {
                let ring = self.ring_with(replica.vault_id(), Some(notification.key_epoch))?;
                self.hlc.observe(notification.hlc_timestamp);
                replica.apply_notification(notification, &ring)
            }
            RealtimeEvent::PresenceSync(_) => Ok(false),
        }
    }

    /// Removes a member and rotates the vault key for everyone else.
    /// Returns the new key epoch.
    ///
    /// The removal commits before the rekey. If the rekey fails, the member
    /// is already gone and [`VaultClient::rekey`] finishes the rotation.
    pub fn remove_member(&self, vault_id: &VaultId, target: &PubkeyHash) -> ClientResult<u32> {
        let response: RemoveMemberResponse = self.call(
            RpcOperation::RemoveMember,
            &RemoveMemberRequest {
                vault_id: *vault_id,
                target: *target,
            },
        )?;
        info!(vault_id = %vault_id, removed = %target.short(), "member removed, rotating key");
        self.rotate(vault_id, &response.remaining)
    }

    /// Rotates the vault key for the current members.
    pub fn rekey(&self, vault_id: &VaultId) -> ClientResult<u32> {
        let targets: Vec<RekeyTarget> = self
            .list_members(vault_id)?
            .into_iter()
            .filter_map(|m| {
                m.enc_public_key.map(|enc_public_key| RekeyTarget {
                    pubkey_hash: m.pubkey_hash,
                    enc_public_key,
                })
            })
            .collect();
        self.rotate(vault_id, &targets)
    }

    /// Every wrapped key carries the retired epochs too, so members that
    /// restart or join later can still read older history.
    fn rotate(&self, vault_id: &VaultId, targets: &[RekeyTarget]) -> ClientResult<u32> {
        self.refresh_vault_key(vault_id)?;
        let history = self.key_ring(vault_id).unwrap_or_default();
        let key = VaultKey::generate();
        let member_keys = targets
            .iter()
            .map(|target| {
                Ok(MemberKey {
                    pubkey_hash: target.pubkey_hash,
                    encrypted_vault_key: wrap_vault_keys(&key, &history, &target.enc_public_key)?,
                })
            })
            .collect::<ClientResult<Vec<_>>>()?;
        let response: RekeyResponse = self.call(
            RpcOperation::Rekey,
            &RekeyRequest {
                vault_id: *vault_id,
                member_keys,
            },
        )?;
        self.store_key(*vault_id, response.key_epoch, key);
        info!(vault_id = %vault_id, key_epoch = response.key_epoch, "vault key rotated");
        Ok(response.key_epoch)
    }

    /// Stores this device's encrypted account data.
    pub fn put_user_data(&self, encrypted_data: Vec<u8>, device_fingerprint: impl Into<String>) -> ClientResult<()> {
        let _: Ack = self.call_with_retry(
            RpcOperation::PutUserData,
            &PutUserDataRequest {
                encrypted_data,
                device_fingerprint: device_fingerprint.into(),
            },
        )?;
        Ok(())
    }

    /// Reads this device's encrypted account data.
    pub fn get_user_data(&self) -> ClientResult<UserData> {
        let response: UserDataResponse = self.call_with_retry(RpcOperation::GetUserData, &())?;
        Ok(response.user_data)
    }
}

impl<T> std::fmt::Debug for VaultClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("signer", &self.signer)
            .field("vaults", &self.keys.read().len())
            .finish_non_exhaustive()
    }
}

/// Key ring for one sync run; refreshes from the server at most once.
struct EpochCache {
    ring: KeyRing,
    refreshed: bool,
}

impl EpochCache {
    fn new(ring: KeyRing) -> Self {
        Self { ring, refreshed: false }
    }

    fn ensure<T: VaultTransport>(
        &mut self,
        client: &VaultClient<T>,
        vault_id: &VaultId,
        key_epoch: u32,
    ) -> ClientResult<()> {
        if self.ring.get(key_epoch).is_some() || self.refreshed {
            return Ok(());
        }
        self.refreshed = true;
        client.refresh_vault_key(vault_id)?;
        if let Some(ring) = client.key_ring(vault_id) {
            self.ring = ring;
        }
        Ok(())
    }
}

fn decode_response<Resp: DeserializeOwned>(operation: RpcOperation, response: &HttpResponse) -> ClientResult<Resp> {
    if response.is_success() {
        return Ok(from_cbor(&response.body)?);
    }
    let body = from_cbor::<ErrorBody>(&response.body).unwrap_or_else(|_| ErrorBody {
        kind: ErrorKind::from_http_status(response.status),
        message: format!("{operation} failed with status {}", response.status),
    });
    Err(ClientError::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgervault_protocol::to_cbor;

    #[test]
    fn error_bodies_become_server_errors() {
        let body = ErrorBody {
            kind: ErrorKind::Forbidden,
            message: "forbidden: only the vault owner may do this".into(),
        };
        let response = HttpResponse {
            status: 403,
            body: to_cbor(&body).unwrap(),
        };
        let err = decode_response::<Ack>(RpcOperation::Rekey, &response).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Forbidden));
    }

    #[test]
    fn unreadable_error_bodies_fall_back_to_status() {
        let response = HttpResponse {
            status: 500,
            body: b"garbage".to_vec(),
        };
        let err = decode_response::<Ack>(RpcOperation::FetchSince, &response).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Internal));
        assert!(err.is_retryable());
    }

    #[test]
    fn success_bodies_decode() {
        let response = HttpResponse {
            status: 200,
            body: to_cbor(&Ack::OK).unwrap(),
        };
        assert_eq!(decode_response::<Ack>(RpcOperation::LeaveVault, &response).unwrap(), Ack::OK);
    }
}
