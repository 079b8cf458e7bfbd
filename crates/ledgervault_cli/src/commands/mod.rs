//! CLI command implementations.

pub mod inspect;
pub mod keygen;
pub mod purge;
pub mod sign;
pub mod verify;

use std::path::Path;

/// Result type shared by the commands.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Reads an optional body file; no file means an empty body.
pub fn read_body(path: Option<&Path>) -> CommandResult<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path)
            .map_err(|e| format!("cannot read body file {}: {e}", path.display()).into()),
        None => Ok(Vec::new()),
    }
}
