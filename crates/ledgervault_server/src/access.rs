//! Membership and role checks shared by every vault operation.

use crate::auth::AuthContext;
use crate::error::{ServerError, ServerResult};
use ledgervault_protocol::{VaultId, VaultMembership};
use ledgervault_store::VaultStore;

/// Returns the caller's membership. A non-member cannot tell a missing
/// vault from one it does not belong to.
pub(crate) fn require_member(
    store: &VaultStore,
    ctx: &AuthContext,
    vault_id: &VaultId,
) -> ServerResult<VaultMembership> {
    store
        .membership(vault_id, &ctx.pubkey_hash)
        .ok_or_else(ServerError::not_found_vault)
}

/// Returns the caller's membership if it is the owner.
pub(crate) fn require_owner(
    store: &VaultStore,
    ctx: &AuthContext,
    vault_id: &VaultId,
) -> ServerResult<VaultMembership> {
    let membership = require_member(store, ctx, vault_id)?;
    if !membership.role.is_owner() {
        return Err(ServerError::Forbidden(
            "only the vault owner may do this".into(),
        ));
    }
    Ok(membership)
}
