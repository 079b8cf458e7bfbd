//! LedgerVault CLI
//!
//! Command-line tools for LedgerVault devices and stores.
//!
//! # Commands
//!
//! - `keygen` - Create a device signing key
//! - `sign` - Produce authentication headers for a request
//! - `verify` - Check authentication headers the way the server does
//! - `inspect` - Display store statistics
//! - `purge-invites` - Delete expired invites from a store

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// LedgerVault command-line tools.
#[derive(Parser)]
#[command(name = "ledgervault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a device signing key
    Keygen {
        /// Write the secret key to this file instead of printing it
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print authentication headers for a request
    Sign {
        /// Secret key file written by `keygen`
        #[arg(short, long)]
        key: PathBuf,

        /// HTTP method
        #[arg(short, long, default_value = "POST")]
        method: String,

        /// Request path
        #[arg(short, long)]
        path: String,

        /// File holding the request body
        #[arg(short, long)]
        body: Option<PathBuf>,
    },

    /// Verify authentication headers
    Verify {
        /// X-Pubkey header value
        #[arg(long)]
        pubkey: String,

        /// X-Timestamp header value
        #[arg(long)]
        timestamp: String,

        /// X-Signature header value
        #[arg(long)]
        signature: String,

        /// HTTP method
        #[arg(short, long, default_value = "POST")]
        method: String,

        /// Request path
        #[arg(short, long)]
        path: String,

        /// File holding the request body
        #[arg(short, long)]
        body: Option<PathBuf>,

        /// Maximum signature age in milliseconds
        #[arg(long)]
        max_age_ms: Option<u64>,
    },

    /// Display store statistics
    Inspect {
        /// Store directory
        #[arg(short, long)]
        store: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete expired invites
    PurgeInvites {
        /// Store directory
        #[arg(short, long)]
        store: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Keygen { out } => commands::keygen::run(out.as_deref())?,
        Commands::Sign {
            key,
            method,
            path,
            body,
        } => commands::sign::run(&key, &method, &path, body.as_deref())?,
        Commands::Verify {
            pubkey,
            timestamp,
            signature,
            method,
            path,
            body,
            max_age_ms,
        } => {
            let headers = ledgervault_server::AuthHeaders {
                pubkey,
                timestamp,
                signature,
            };
            let verified = commands::verify::run(&headers, &method, &path, body.as_deref(), max_age_ms)?;
            if !verified {
                std::process::exit(1);
            }
        }
        Commands::Inspect { store, format } => commands::inspect::run(&store, &format)?,
        Commands::PurgeInvites { store } => commands::purge::run(&store)?,
        Commands::Version => {
            println!("LedgerVault CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
