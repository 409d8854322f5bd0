//! Decrypt a stored message document.

use anyhow::{Context, Result};
use link_client::{load_keyring, open_document};
use serde_json::Value;
use std::path::Path;

use crate::config::{self, DeviceIdentity};

/// Decrypt the document in `file` with this installation's keys.
pub async fn body(data_dir: &Path, file: &Path) -> Result<String> {
    let identity = DeviceIdentity::load(data_dir).await?;
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let doc: Value = serde_json::from_str(&contents).context("Document is not JSON")?;

    let keys = config::key_store(data_dir);
    let keyring = load_keyring(&keys, Some(identity.device_id))
        .await
        .context("Failed to read key store")?;
    open_document(&doc, &keyring).context("Failed to decrypt message")
}

/// Run the decrypt command.
pub async fn run(data_dir: &Path, file: &Path) -> Result<()> {
    println!("{}", body(data_dir, file).await?);
    Ok(())
}
