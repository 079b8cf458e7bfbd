//! Per-device user data.

use crate::auth::AuthContext;
use crate::error::{ServerError, ServerResult};
use ledgervault_protocol::{PutUserDataRequest, UserData};
use ledgervault_store::VaultStore;
use std::sync::Arc;
use tracing::debug;

/// Largest accepted device fingerprint.
const MAX_FINGERPRINT_LEN: usize = 256;

/// Stores each device's wrapped identity material.
#[derive(Debug, Clone)]
pub struct Accounts {
    store: Arc<VaultStore>,
}

impl Accounts {
    /// Creates the accounts service.
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self { store }
    }

    /// Upserts the caller's own row.
    pub fn put_user_data(&self, ctx: &AuthContext, request: PutUserDataRequest) -> ServerResult<UserData> {
        if request.device_fingerprint.len() > MAX_FINGERPRINT_LEN {
            return Err(ServerError::BadRequest("device fingerprint too long".into()));
        }
        let row = self.store.put_user_data(
            ctx.pubkey_hash,
            request.encrypted_data,
            request.device_fingerprint,
        )?;
        debug!(user = %ctx.pubkey_hash.short(), bytes = row.encrypted_data.len(), "user data stored");
        Ok(row)
    }

    /// Returns the caller's row.
    pub fn get_user_data(&self, ctx: &AuthContext) -> ServerResult<UserData> {
        self.store
            .user_data(&ctx.pubkey_hash)
            .ok_or_else(|| ServerError::NotFound("no user data".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgervault_protocol::{DeviceKeypair, ManualClock};

    fn accounts() -> (Accounts, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(5));
        let store = Arc::new(VaultStore::open_in_memory(clock.clone()).unwrap());
        (Accounts::new(store), clock)
    }

    #[test]
    fn rows_are_per_caller() {
        let (accounts, clock) = accounts();
        let a = AuthContext::for_key(DeviceKeypair::generate().public_key());
        let b = AuthContext::for_key(DeviceKeypair::generate().public_key());

        assert!(matches!(accounts.get_user_data(&a), Err(ServerError::NotFound(_))));
        accounts
            .put_user_data(
                &a,
                PutUserDataRequest {
                    encrypted_data: vec![1, 2],
                    device_fingerprint: "laptop".into(),
                },
            )
            .unwrap();
        clock.advance(10);
        let row = accounts
            .put_user_data(
                &a,
                PutUserDataRequest {
                    encrypted_data: vec![3],
                    device_fingerprint: "laptop".into(),
                },
            )
            .unwrap();
        assert_eq!(row.updated_at, 15);
        assert_eq!(accounts.get_user_data(&a).unwrap().encrypted_data, vec![3]);
        assert!(accounts.get_user_data(&b).is_err());
    }

    #[test]
    fn long_fingerprint_is_rejected() {
        let (accounts, _) = accounts();
        let a = AuthContext::for_key(DeviceKeypair::generate().public_key());
        let result = accounts.put_user_data(
            &a,
            PutUserDataRequest {
                encrypted_data: vec![],
                device_fingerprint: "x".repeat(MAX_FINGERPRINT_LEN + 1),
            },
        );
        assert!(matches!(result, Err(ServerError::BadRequest(_))));
    }
}
