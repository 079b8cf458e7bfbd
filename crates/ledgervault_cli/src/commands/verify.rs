//! Verify command implementation.

use super::{read_body, CommandResult};
use ledgervault_protocol::{Clock, SystemClock};
use ledgervault_server::{AuthConfig, AuthHeaders, RequestAuthenticator, Verification};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Verifies headers against a clock, with an optional maximum age.
pub fn check(
    clock: Arc<dyn Clock>,
    headers: &AuthHeaders,
    method: &str,
    path: &str,
    body: &[u8],
    max_age_ms: Option<u64>,
) -> Verification {
    let authenticator = RequestAuthenticator::new(AuthConfig::default(), clock);
    let max_age = max_age_ms.map_or(authenticator.config().max_age, Duration::from_millis);
    authenticator
        .verify_with_max_age(method, path, body, headers, max_age)
        .into()
}

/// Runs the verify command. Returns whether the headers verified.
pub fn run(
    headers: &AuthHeaders,
    method: &str,
    path: &str,
    body: Option<&Path>,
    max_age_ms: Option<u64>,
) -> CommandResult<bool> {
    let body = read_body(body)?;
    let verification = check(Arc::new(SystemClock), headers, method, path, &body, max_age_ms);
    match (&verification.pubkey_hash, &verification.error) {
        (Some(hash), _) => println!("verified: {}", hash.to_hex()),
        (None, Some(error)) => println!("rejected: {error}"),
        (None, None) => println!("rejected"),
    }
    Ok(verification.verified)
}
