//! vpnd: the vpn-indexer daemon.
//!
//! Single binary that assembles the indexer subsystems:
//! - State store (redb)
//! - WireGuard peer ledger, endpoint client and startup reconciliation
//! - Chain follower (event router + sync status)
//! - Metrics / health listener
//!
//! # Usage
//!
//! ```text
//! vpnd run --config /etc/vpn-indexer/vpn-indexer.toml
//! vpnd reference import reference.json --config vpn-indexer.toml
//! vpnd reference import datum.hex --datum-hex --output <tx hash>#0
//! vpnd reference show --config vpn-indexer.toml
//! ```

mod daemon;
mod http;
mod reference;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vpn_core::OutputRef;
use vpn_core::config::{Config, LoggingConfig};

#[derive(Parser)]
#[command(name = "vpnd", about = "vpn-indexer daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow the chain and serve metrics until interrupted.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "vpn-indexer.toml")]
        config: PathBuf,
    },

    /// Inspect or seed the stored reference data.
    Reference {
        #[command(subcommand)]
        command: ReferenceCommand,
    },
}

#[derive(Subcommand)]
enum ReferenceCommand {
    /// Replace the stored reference data from a file.
    Import {
        /// JSON snapshot, or hex-encoded datum CBOR with --datum-hex.
        file: PathBuf,

        /// Treat the file as a hex-encoded reference datum.
        #[arg(long, requires = "output")]
        datum_hex: bool,

        /// Output that carried the datum (`<tx hash>#<index>`).
        #[arg(long)]
        output: Option<OutputRef>,

        #[arg(long, default_value = "vpn-indexer.toml")]
        config: PathBuf,
    },

    /// Print the stored reference data as JSON.
    Show {
        #[arg(long, default_value = "vpn-indexer.toml")]
        config: PathBuf,
    },
}

fn init_logging(logging: &LoggingConfig) {
    let default = if logging.debug {
        "debug"
    } else {
        "info,vpnd=debug,vpn=debug"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::from_file(path)?;
    init_logging(&config.logging);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let config = load_config(&config)?;
            daemon::run(config).await
        }
        Command::Reference { command } => match command {
            ReferenceCommand::Import {
                file,
                datum_hex,
                output,
                config,
            } => {
                let config = load_config(&config)?;
                let store = daemon::open_store(&config)?;
                let snapshot = if datum_hex {
                    reference::from_datum_hex_file(&file, output)?
                } else {
                    reference::from_json_file(&file)?
                };
                reference::import(&store, &snapshot)
            }
            ReferenceCommand::Show { config } => {
                let config = load_config(&config)?;
                let store = daemon::open_store(&config)?;
                println!("{}", reference::show(&store)?);
                Ok(())
            }
        },
    }
}
