//! Keygen command implementation.

use super::CommandResult;
use ledgervault_protocol::DeviceKeypair;
use std::path::Path;

/// Key file contents: the hex-encoded Ed25519 secret.
pub fn encode_key_file(keypair: &DeviceKeypair) -> String {
    format!("{}\n", hex::encode(keypair.secret_bytes()))
}

/// Loads a key file written by [`encode_key_file`].
pub fn load_key_file(path: &Path) -> CommandResult<DeviceKeypair> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read key file {}: {e}", path.display()))?;
    let bytes = hex::decode(text.trim()).map_err(|e| format!("key file is not hex: {e}"))?;
    Ok(DeviceKeypair::from_secret_bytes(&bytes)?)
}

/// Runs the keygen command.
pub fn run(out: Option<&Path>) -> CommandResult<()> {
    let keypair = DeviceKeypair::generate();
    match out {
        Some(path) => {
            if path.exists() {
                return Err(format!("refusing to overwrite {}", path.display()).into());
            }
            std::fs::write(path, encode_key_file(&keypair))?;
            println!("secret key:  written to {}", path.display());
        }
        None => print!("secret key:  {}", encode_key_file(&keypair)),
    }
    println!("public key:  {}", keypair.public_key().to_base64());
    println!("pubkey hash: {}", keypair.pubkey_hash().to_hex());
    Ok(())
}
