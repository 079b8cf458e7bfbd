//! Vault lifecycle, invites, removal, leave and re-keying.

use crate::access::{require_member, require_owner};
use crate::auth::AuthContext;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use ledgervault_protocol::signing::invite_accept_payload;
use ledgervault_protocol::{
    AcceptInviteRequest, CreateInviteRequest, CreateVaultRequest, InviteId, MemberKey,
    MembershipResponse, PubkeyHash, RekeyTarget, Role, Vault, VaultId, VaultInvite, VaultMembership,
};
use ledgervault_store::{NewVault, VaultStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Coordinates membership changes and key rotation.
#[derive(Debug, Clone)]
pub struct MembershipCoordinator {
    store: Arc<VaultStore>,
    config: Arc<ServerConfig>,
}

impl MembershipCoordinator {
    /// Creates the coordinator.
    pub fn new(store: Arc<VaultStore>, config: Arc<ServerConfig>) -> Self {
        Self { store, config }
    }

    /// Creates a vault owned by the caller, with its genesis snapshot.
    pub fn create_vault(&self, ctx: &AuthContext, request: CreateVaultRequest) -> ServerResult<Vault> {
        if request.encrypted_vault_key.is_empty() {
            return Err(ServerError::BadRequest("owner vault key is empty".into()));
        }
        let vault = self.store.create_vault(NewVault {
            id: request.vault_id,
            owner: ctx.pubkey_hash,
            encrypted_vault_key: request.encrypted_vault_key,
            enc_public_key: request.enc_public_key,
            genesis_data: request.genesis_data,
            genesis_hlc: request.genesis_hlc,
        })?;
        info!(vault_id = %vault.id, owner = %ctx.pubkey_hash.short(), "vault created");
        Ok(vault)
    }

    /// Returns the caller's own membership, including its wrapped vault key
    /// and the newest HLC accepted from it.
    pub fn own_membership(&self, ctx: &AuthContext, vault_id: &VaultId) -> ServerResult<MembershipResponse> {
        let membership = require_member(&self.store, ctx, vault_id)?;
        Ok(MembershipResponse {
            membership,
            author_head: self.store.author_head(vault_id, &ctx.pubkey_hash),
        })
    }

    /// Deletes a vault and everything in it. Owner only.
    pub fn delete_vault(&self, ctx: &AuthContext, vault_id: &VaultId) -> ServerResult<()> {
        require_owner(&self.store, ctx, vault_id)?;
        self.store.delete_vault(vault_id)?;
        Ok(())
    }

    /// Creates a single-use invite.
    ///
    /// Owners may invite with any role. Members may invite plain members
    /// when `members_can_invite` is set. The lifetime is clamped to
    /// `invite_max_ttl`.
    pub fn create_invite(
        &self,
        ctx: &AuthContext,
        request: CreateInviteRequest,
    ) -> ServerResult<VaultInvite> {
        let membership = require_member(&self.store, ctx, &request.vault_id)?;
        if !membership.role.is_owner() {
            if !self.config.members_can_invite {
                return Err(ServerError::Forbidden("only the owner may invite".into()));
            }
            if request.role.is_owner() {
                return Err(ServerError::Forbidden(
                    "members may only invite members".into(),
                ));
            }
        }
        if request.ttl_ms == 0 {
            return Err(ServerError::BadRequest("invite ttl must be positive".into()));
        }
        if request.encrypted_vault_key.is_empty() {
            return Err(ServerError::BadRequest("invite vault key is empty".into()));
        }

        let max_ttl = u64::try_from(self.config.invite_max_ttl.as_millis()).unwrap_or(u64::MAX);
        let now = self.store.clock().now_millis();
        let invite = VaultInvite {
            id: InviteId::new(),
            vault_id: request.vault_id,
            invite_pubkey: request.invite_pubkey,
            encrypted_vault_key: request.encrypted_vault_key,
            role: request.role,
            created_by: ctx.pubkey_hash,
            created_at: now,
            expires_at: now.saturating_add(request.ttl_ms.min(max_ttl)),
        };
        self.store.insert_invite(invite.clone())?;
        info!(
            vault_id = %invite.vault_id,
            invite_id = %invite.id,
            role = %invite.role,
            expires_at = invite.expires_at,
            "invite created"
        );
        Ok(invite)
    }

    /// Accepts an invite, proving possession of the invite key.
    pub fn accept_invite(
        &self,
        ctx: &AuthContext,
        request: AcceptInviteRequest,
    ) -> ServerResult<VaultMembership> {
        let now = self.store.clock().now_millis();
        let invite = self
            .store
            .invite(&request.invite_id)
            .filter(|i| !i.is_expired(now))
            .ok_or_else(|| ServerError::NotFound("invite not found".into()))?;

        let payload = invite_accept_payload(&invite.id.to_string(), &ctx.pubkey_hash);
        if let Err(err) = invite.invite_pubkey.verify(&payload, &request.invite_signature) {
            warn!(invite_id = %invite.id, acceptor = %ctx.pubkey_hash.short(), "invite proof rejected");
            return Err(ServerError::Unauthorized(format!("invalid invite proof: {err}")));
        }
        if self.store.membership(&invite.vault_id, &ctx.pubkey_hash).is_some() {
            return Err(ServerError::BadRequest("already a member of this vault".into()));
        }
        if request.encrypted_vault_key.is_empty() {
            return Err(ServerError::BadRequest("accepted vault key is empty".into()));
        }

        Ok(self.store.consume_invite(
            &invite.id,
            ctx.pubkey_hash,
            request.encrypted_vault_key,
            request.enc_public_key,
        )?)
    }

    /// Lists pending invites. Owner only.
    pub fn list_invites(&self, ctx: &AuthContext, vault_id: &VaultId) -> ServerResult<Vec<VaultInvite>> {
        require_owner(&self.store, ctx, vault_id)?;
        Ok(self.store.invites(vault_id, self.store.clock().now_millis()))
    }

    /// Deletes expired invites across all vaults.
    pub fn purge_expired_invites(&self) -> ServerResult<usize> {
        Ok(self
            .store
            .purge_expired_invites(self.store.clock().now_millis())?)
    }

    /// Removes a member. Owner only.
    ///
    /// Returns the remaining members that can receive a new vault key; the
    /// caller is expected to follow up with [`Self::rekey`].
    pub fn remove(
        &self,
        ctx: &AuthContext,
        vault_id: &VaultId,
        target: &PubkeyHash,
    ) -> ServerResult<Vec<RekeyTarget>> {
        require_owner(&self.store, ctx, vault_id)?;
        if *target == ctx.pubkey_hash {
            return Err(ServerError::BadRequest(
                "the owner cannot remove itself; delete the vault instead".into(),
            ));
        }
        if self.store.membership(vault_id, target).is_none() {
            return Err(ServerError::NotFound("member not found".into()));
        }
        self.store.delete_membership(vault_id, target)?;
        info!(vault_id = %vault_id, removed = %target.short(), "member removed");
        self.rekey_targets(vault_id)
    }

    /// Leaves a vault. Owners must delete the vault instead.
    pub fn leave(&self, ctx: &AuthContext, vault_id: &VaultId) -> ServerResult<()> {
        let membership = require_member(&self.store, ctx, vault_id)?;
        if membership.role == Role::Owner {
            return Err(ServerError::BadRequest(
                "the owner cannot leave; delete the vault instead".into(),
            ));
        }
        self.store.delete_membership(vault_id, &ctx.pubkey_hash)?;
        info!(vault_id = %vault_id, member = %ctx.pubkey_hash.short(), "member left");
        Ok(())
    }

    /// Installs a new vault key for every remaining member in one atomic
    /// store operation. Owner only. Returns the new key epoch.
    pub fn rekey(
        &self,
        ctx: &AuthContext,
        vault_id: &VaultId,
        member_keys: Vec<MemberKey>,
    ) -> ServerResult<u32> {
        require_owner(&self.store, ctx, vault_id)?;
        Ok(self.store.rotate_keys(vault_id, member_keys)?)
    }

    /// Members with a key-encapsulation public key.
    pub fn rekey_targets(&self, vault_id: &VaultId) -> ServerResult<Vec<RekeyTarget>> {
        Ok(self
            .store
            .members(vault_id)?
            .into_iter()
            .filter_map(|m| {
                m.enc_public_key.map(|enc_public_key| RekeyTarget {
                    pubkey_hash: m.pubkey_hash,
                    enc_public_key,
                })
            })
            .collect())
    }
}
