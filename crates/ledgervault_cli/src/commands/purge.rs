//! Purge-invites command implementation.

use super::inspect::open_store;
use super::CommandResult;
use ledgervault_protocol::{Clock, SystemClock};
use std::path::Path;
use tracing::info;

/// Runs the purge-invites command.
pub fn run(path: &Path) -> CommandResult<()> {
    let store = open_store(path)?;
    let purged = store.purge_expired_invites(SystemClock.now_millis())?;
    info!(purged, "expired invites purged");
    println!("Purged {purged} expired invite(s)");
    Ok(())
}
