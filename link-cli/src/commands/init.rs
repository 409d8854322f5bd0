//! Initialize device keys, identity and configuration.

use anyhow::{Context, Result};
use link_client::{Config, KeyPair, KeyStore, SyncGroupKey};
use link_types::{Platform, SyncGroupId};
use std::path::Path;

use crate::config::{self, DeviceIdentity, Role};

/// Run the init command.
pub async fn run(
    data_dir: &Path,
    name: &str,
    role: Role,
    platform: Option<Platform>,
    own_numbers: Vec<String>,
) -> Result<()> {
    if DeviceIdentity::exists(data_dir) {
        anyhow::bail!(
            "Device already initialized. Delete {} to reinitialize.",
            data_dir.join(config::DEVICE_FILE).display()
        );
    }
    let platform = match role {
        Role::Host => None,
        Role::Device => Some(platform.unwrap_or(Platform::Macos)),
    };

    let keys = config::key_store(data_dir);
    let device_key = KeyPair::generate();
    let device_public = device_key.public_key();
    keys.set_device_key(device_key)
        .await
        .context("Failed to store device key")?;

    let group_id = if role == Role::Host {
        let group = SyncGroupKey {
            id: SyncGroupId::new(config::random_hex(16)),
            keypair: KeyPair::generate(),
        };
        let id = group.id.clone();
        keys.set_group_key(group)
            .await
            .context("Failed to store sync-group key")?;
        Some(id)
    } else {
        None
    };

    let mut settings = Config::default();
    settings.device.name = name.to_string();
    settings.device.own_numbers = own_numbers;
    let config_path = config::save_config(data_dir, &settings).await?;

    let identity = DeviceIdentity::new(name, role, platform);
    identity.save(data_dir).await?;

    println!("Device initialized successfully!");
    println!();
    println!("  Device ID:  {}", identity.device_id);
    println!("  Name:       {}", identity.device_name);
    println!("  Role:       {:?}", identity.role);
    println!("  Public key: {}", device_public);
    if let Some(id) = group_id {
        println!("  Sync group: {}", id);
    }
    println!("  Config:     {}", config_path.display());
    println!();
    println!("Next steps:");
    match role {
        Role::Host => println!("  Scan a device's QR payload to pair it."),
        Role::Device => println!("  Show your pairing payload: phonelink qr"),
    }

    Ok(())
}
