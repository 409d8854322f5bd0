//! # phonelink
//!
//! Host harness for the phonelink sync engine.
//!
//! ## Commands
//!
//! - `init`: Create device keys, identity and `phonelink.toml`
//! - `qr`: Print the pairing QR payload of a paired-device installation
//! - `status`: Show identity, keys and configuration
//! - `decrypt`: Decrypt a stored message document
//! - `demo`: Pair a device and sync messages against the in-memory backend
//!
//! ## Example
//!
//! ```bash
//! # On the phone side
//! phonelink --data-dir ./phone init --name "Pixel" --host --own-number +15550001111
//!
//! # On a desktop
//! phonelink --data-dir ./mac init --name "MacBook" --platform macos
//! phonelink --data-dir ./mac qr
//!
//! # Decrypt a record exported from the store
//! phonelink --data-dir ./mac decrypt message.json
//!
//! # Whole flow in memory
//! phonelink demo --messages 3
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use link_types::Platform;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{decrypt, demo, init, qr, status};

/// Host harness for the phonelink sync engine.
#[derive(Parser, Debug)]
#[command(name = "phonelink")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for keys, identity and configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create device keys, identity and configuration
    Init {
        /// Device name
        #[arg(long, short)]
        name: String,

        /// This installation is the phone (owns the sync-group key)
        #[arg(long, conflicts_with = "platform")]
        host: bool,

        /// Platform of a paired device (ios, macos, windows, web)
        #[arg(long)]
        platform: Option<Platform>,

        /// The phone's own number (repeat for dual SIM)
        #[arg(long = "own-number")]
        own_numbers: Vec<String>,
    },

    /// Print the pairing QR payload of this device
    Qr {
        /// Pairing token issued by the backend (random when omitted)
        #[arg(long)]
        token: Option<String>,
    },

    /// Show identity, keys and configuration
    Status,

    /// Decrypt a stored message document (JSON file)
    Decrypt {
        /// Path to the message document
        file: PathBuf,
    },

    /// Pair a device and sync messages against the in-memory backend
    Demo {
        /// Number of messages to sync
        #[arg(long, default_value = "3")]
        messages: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    let level = config::load_config(&data_dir)
        .map(|c| c.log.level)
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Init {
            name,
            host,
            platform,
            own_numbers,
        } => {
            tokio::fs::create_dir_all(&data_dir)
                .await
                .context("Failed to create data directory")?;
            config::set_dir_permissions_0700(&data_dir).await?;
            let role = if host {
                config::Role::Host
            } else {
                config::Role::Device
            };
            init::run(&data_dir, &name, role, platform, own_numbers).await?;
        }
        Commands::Qr { token } => {
            qr::run(&data_dir, token).await?;
        }
        Commands::Status => {
            status::run(&data_dir).await?;
        }
        Commands::Decrypt { file } => {
            decrypt::run(&data_dir, &file).await?;
        }
        Commands::Demo { messages } => {
            demo::run(messages).await?;
        }
    }

    Ok(())
}

/// Log to stderr; `RUST_LOG` overrides the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory for phonelink.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "phonelink", "phonelink")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
