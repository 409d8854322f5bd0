//! Print the pairing QR payload of this device.

use anyhow::{Context, Result};
use link_client::KeyStore;
use link_core::pairing::QR_PAYLOAD_VERSION;
use link_core::PairingQrPayload;
use std::path::Path;

use crate::config::{self, DeviceIdentity, Role};

/// Build the payload text.
pub async fn payload(data_dir: &Path, token: Option<String>) -> Result<String> {
    let identity = DeviceIdentity::load(data_dir).await?;
    if identity.role == Role::Host {
        anyhow::bail!("The phone scans pairing codes; it does not show one.");
    }
    let keys = config::key_store(data_dir);
    let device_key = keys
        .device_key()
        .await
        .context("Failed to read key store")?
        .context("No device key. Run 'phonelink init' first.")?;
    let group = keys.group_key().await.context("Failed to read key store")?;

    let payload = PairingQrPayload {
        token: token.unwrap_or_else(|| config::random_hex(16)),
        name: identity.device_name,
        platform: identity.platform.unwrap_or(link_types::Platform::Macos),
        version: QR_PAYLOAD_VERSION,
        public_key: device_key.public_key(),
        sync_group_id: group.map(|g| g.id),
    };
    payload.to_json().context("Failed to encode pairing payload")
}

/// Run the qr command.
pub async fn run(data_dir: &Path, token: Option<String>) -> Result<()> {
    println!("{}", payload(data_dir, token).await?);
    Ok(())
}
