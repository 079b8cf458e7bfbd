//! Sign command implementation.

use super::keygen::load_key_file;
use super::{read_body, CommandResult};
use ledgervault_protocol::{Clock, DeviceKeypair, SignedHeaders, SystemClock};
use std::path::Path;

/// Signs a request at `timestamp_ms`.
pub fn sign(keypair: &DeviceKeypair, method: &str, path: &str, body: &[u8], timestamp_ms: u64) -> SignedHeaders {
    SignedHeaders::sign(keypair, method, path, body, timestamp_ms)
}

/// Runs the sign command.
pub fn run(key: &Path, method: &str, path: &str, body: Option<&Path>) -> CommandResult<()> {
    let keypair = load_key_file(key)?;
    let body = read_body(body)?;
    let headers = sign(&keypair, method, path, &body, SystemClock.now_millis());
    for (name, value) in headers.into_pairs() {
        println!("{name}: {value}");
    }
    Ok(())
}
