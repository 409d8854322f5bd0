//! Show identity, keys and configuration.

use anyhow::{Context, Result};
use link_client::KeyStore;
use std::path::Path;

use crate::config::{self, DeviceIdentity};

/// Run the status command.
pub async fn run(data_dir: &Path) -> Result<()> {
    println!("=== phonelink status ===");
    println!();

    let identity = match DeviceIdentity::load(data_dir).await {
        Ok(identity) => identity,
        Err(_) => {
            println!("Device: NOT INITIALIZED");
            println!();
            println!("Run 'phonelink init --name <name>' to initialize.");
            return Ok(());
        }
    };

    println!("Device:");
    println!("  ID:   {}", identity.device_id);
    println!("  Name: {}", identity.device_name);
    println!("  Role: {:?}", identity.role);
    if let Some(platform) = identity.platform {
        println!("  Platform: {}", platform.as_str());
    }
    println!("  Init: {}", format_timestamp(identity.created_at));
    println!();

    let keys = config::key_store(data_dir);
    println!("Keys ({}):", keys.path().display());
    match keys.device_key().await.context("Failed to read key store")? {
        Some(pair) => println!("  Device key: {}", pair.public_key()),
        None => println!("  Device key: MISSING"),
    }
    match keys.group_key().await.context("Failed to read key store")? {
        Some(group) => println!("  Sync group: {} ({})", group.id, group.keypair.public_key()),
        None => println!("  Sync group: none (not paired yet)"),
    }
    println!();

    let settings = config::load_config(data_dir)?;
    println!("Configuration:");
    println!("  E2EE:        {}", if settings.sync.e2ee_enabled { "enabled" } else { "DISABLED" });
    println!("  Batch size:  {}", settings.sync.batch_size);
    println!("  Own numbers: {}", settings.device.own_numbers.len());
    println!("  Log level:   {}", settings.log.level);

    Ok(())
}

/// Format a Unix ms timestamp relative to now.
fn format_timestamp(ts_ms: u64) -> String {
    let diff = link_types::now_millis().saturating_sub(ts_ms) / 1000;

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}
