//! Request authentication.
//!
//! Every call carries an Ed25519 signature over the canonical payload of
//! method, path, timestamp and body digest (see
//! [`ledgervault_protocol::signing`]). Verification is stateless: the
//! caller's identity is the SHA-256 hash of the presented public key, and
//! freshness is bounded by the timestamp.

use crate::error::{ServerError, ServerResult};
use ledgervault_protocol::signing::{
    decode_signature, verify_request, HEADER_PUBKEY, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use ledgervault_protocol::{Clock, DevicePublicKey, HttpRequest, PubkeyHash};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Signature freshness rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Oldest accepted signature.
    pub max_age: Duration,
    /// Furthest a timestamp may lie in the future.
    pub max_clock_skew: Duration,
}

impl AuthConfig {
    /// Creates the default rules: five minutes of age, thirty seconds of skew.
    pub fn new() -> Self {
        Self {
            max_age: Duration::from_secs(5 * 60),
            max_clock_skew: Duration::from_secs(30),
        }
    }

    /// Sets the maximum age.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The three raw authentication header values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    /// `X-Pubkey`
    pub pubkey: String,
    /// `X-Timestamp`
    pub timestamp: String,
    /// `X-Signature`
    pub signature: String,
}

impl AuthHeaders {
    /// Extracts the headers from a request. Missing headers are
    /// `Unauthorized`.
    pub fn from_request(request: &HttpRequest) -> ServerResult<Self> {
        let get = |name: &str| {
            request
                .header(name)
                .map(str::to_string)
                .ok_or_else(|| ServerError::Unauthorized(format!("missing {name} header")))
        };
        Ok(Self {
            pubkey: get(HEADER_PUBKEY)?,
            timestamp: get(HEADER_TIMESTAMP)?,
            signature: get(HEADER_SIGNATURE)?,
        })
    }
}

/// Identity of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    /// Durable user identifier.
    pub pubkey_hash: PubkeyHash,
    /// Presented public key.
    pub public_key: DevicePublicKey,
}

impl AuthContext {
    /// Builds a context for a key without checking any signature. Used by
    /// trusted in-process callers.
    pub fn for_key(public_key: DevicePublicKey) -> Self {
        Self {
            pubkey_hash: public_key.pubkey_hash(),
            public_key,
        }
    }
}

/// Outcome of a verification in `{verified, pubkey_hash, error}` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// True if the request is authentic and fresh.
    pub verified: bool,
    /// Caller identity when verified.
    pub pubkey_hash: Option<PubkeyHash>,
    /// Rejection reason otherwise.
    pub error: Option<String>,
}

impl From<ServerResult<AuthContext>> for Verification {
    fn from(result: ServerResult<AuthContext>) -> Self {
        match result {
            Ok(ctx) => Self {
                verified: true,
                pubkey_hash: Some(ctx.pubkey_hash),
                error: None,
            },
            Err(err) => Self {
                verified: false,
                pubkey_hash: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Verifies signed requests.
#[derive(Clone)]
pub struct RequestAuthenticator {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
}

impl RequestAuthenticator {
    /// Creates an authenticator.
    pub fn new(config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Returns the freshness rules.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Verifies a request.
    pub fn authenticate(&self, request: &HttpRequest) -> ServerResult<AuthContext> {
        let headers = AuthHeaders::from_request(request)?;
        self.verify(&request.method, &request.path, &request.body, &headers)
    }

    /// Verifies explicit components using the configured maximum age.
    pub fn verify(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &AuthHeaders,
    ) -> ServerResult<AuthContext> {
        self.verify_with_max_age(method, path, body, headers, self.config.max_age)
    }

    /// Verifies explicit components against a caller-chosen maximum age.
    pub fn verify_with_max_age(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &AuthHeaders,
        max_age: Duration,
    ) -> ServerResult<AuthContext> {
        let public_key = DevicePublicKey::from_base64(&headers.pubkey)
            .map_err(|e| ServerError::Unauthorized(e.to_string()))?;
        let timestamp: u64 = headers
            .timestamp
            .trim()
            .parse()
            .map_err(|_| ServerError::Unauthorized("malformed timestamp".into()))?;
        let signature = decode_signature(&headers.signature)
            .map_err(|e| ServerError::Unauthorized(e.to_string()))?;

        verify_request(&public_key, method, path, body, timestamp, &signature)
            .map_err(|e| ServerError::Unauthorized(e.to_string()))?;

        let now = self.clock.now_millis();
        if now.saturating_sub(timestamp) > duration_millis(max_age) {
            return Err(ServerError::Unauthorized("signature expired".into()));
        }
        if timestamp.saturating_sub(now) > duration_millis(self.config.max_clock_skew) {
            return Err(ServerError::Unauthorized(
                "signature timestamp is in the future".into(),
            ));
        }

        let ctx = AuthContext::for_key(public_key);
        debug!(caller = %ctx.pubkey_hash.short(), method, path, "request authenticated");
        Ok(ctx)
    }
}

impl std::fmt::Debug for RequestAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAuthenticator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
