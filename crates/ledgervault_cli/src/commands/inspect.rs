//! Inspect command implementation.

use super::CommandResult;
use ledgervault_protocol::SystemClock;
use ledgervault_store::{StoreConfig, StoreStats, VaultStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Journal size in bytes.
    pub journal_bytes: u64,
    /// Valid journal records.
    pub journal_records: u64,
    /// Bytes cut from a torn journal tail on open.
    pub truncated_bytes: u64,
    /// Journal records per kind.
    pub records_by_kind: BTreeMap<String, u64>,
    /// Last assigned update id.
    pub last_update_id: u64,
    /// User data rows.
    pub user_data: usize,
    /// Per-vault statistics.
    pub vaults: Vec<VaultStats>,
}

/// Statistics for a single vault.
#[derive(Debug, Serialize)]
pub struct VaultStats {
    /// Vault id.
    pub id: String,
    /// Current key epoch.
    pub key_epoch: u32,
    /// Highest pruned update id.
    pub pruned_through: u64,
    /// Members.
    pub members: usize,
    /// Stored snapshots.
    pub snapshots: usize,
    /// Latest snapshot version.
    pub latest_version: u64,
    /// Stored updates.
    pub updates: usize,
    /// Pending invites.
    pub invites: usize,
}

impl InspectResult {
    /// Builds the report from store counters.
    pub fn from_stats(path: &Path, stats: StoreStats) -> Self {
        Self {
            path: path.display().to_string(),
            journal_bytes: stats.journal.bytes,
            journal_records: stats.journal.records,
            truncated_bytes: stats.journal.truncated_bytes,
            records_by_kind: stats
                .journal
                .by_kind
                .iter()
                .map(|(kind, count)| ((*kind).to_string(), *count))
                .collect(),
            last_update_id: stats.last_update_id,
            user_data: stats.user_data,
            vaults: stats
                .vaults
                .into_iter()
                .map(|summary| VaultStats {
                    id: summary.vault.id.to_string(),
                    key_epoch: summary.vault.key_epoch,
                    pruned_through: summary.vault.pruned_through,
                    members: summary.members,
                    snapshots: summary.snapshots,
                    latest_version: summary.latest_version,
                    updates: summary.updates,
                    invites: summary.invites,
                })
                .collect(),
        }
    }
}

/// Opens an existing store directory.
pub fn open_store(path: &Path) -> CommandResult<VaultStore> {
    if !path.exists() {
        return Err(format!("No store found at {:?}", path).into());
    }
    let config = StoreConfig::default().with_create_if_missing(false);
    Ok(VaultStore::open(path, &config, Arc::new(SystemClock))?)
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> CommandResult<()> {
    let store = open_store(path)?;
    let result = InspectResult::from_stats(path, store.stats());

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("LedgerVault Store: {}", result.path);
    println!();
    println!("Journal:");
    println!("  Size:      {} bytes", result.journal_bytes);
    println!("  Records:   {}", result.journal_records);
    if result.truncated_bytes > 0 {
        println!("  Truncated: {} bytes (torn tail)", result.truncated_bytes);
    }
    for (kind, count) in &result.records_by_kind {
        println!("    {kind:<20} {count}");
    }
    println!();
    println!("Last update id: {}", result.last_update_id);
    println!("User data rows: {}", result.user_data);
    println!();
    println!("Vaults ({}):", result.vaults.len());
    for vault in &result.vaults {
        println!(
            "  {}  epoch={} members={} snapshots={} (v{}) updates={} pruned<={} invites={}",
            vault.id,
            vault.key_epoch,
            vault.members,
            vault.snapshots,
            vault.latest_version,
            vault.updates,
            vault.pruned_through,
            vault.invites
        );
    }
}
