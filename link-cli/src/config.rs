//! Local files of the phonelink CLI.
//!
//! Everything lives in one data directory:
//! - `phonelink.toml` - engine configuration ([`link_client::Config`])
//! - `device.json` - device identity
//! - `keys.json` - private keys ([`link_client::FileKeyStore`])

use anyhow::{Context, Result};
use link_client::{Config, FileKeyStore};
use link_types::{now_millis, DeviceId, Platform};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file name.
pub const CONFIG_FILE: &str = "phonelink.toml";
/// Device identity file name.
pub const DEVICE_FILE: &str = "device.json";
/// Key file name.
pub const KEYS_FILE: &str = "keys.json";

/// Role this installation plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The phone: owns the sync-group key and pushes it to devices.
    Host,
    /// A paired client.
    Device,
}

/// Device identity stored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Local device id (replaced by the backend-assigned id once paired).
    pub device_id: DeviceId,
    /// Human-readable device name.
    pub device_name: String,
    /// Host or paired device.
    pub role: Role,
    /// Client platform (paired devices only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// When the device was initialized (Unix ms).
    pub created_at: u64,
}

impl DeviceIdentity {
    /// Create a new identity with a random id.
    pub fn new(name: &str, role: Role, platform: Option<Platform>) -> Self {
        Self {
            device_id: DeviceId::new(random_hex(8)),
            device_name: name.to_string(),
            role,
            platform,
            created_at: now_millis(),
        }
    }

    /// Load the identity from a data directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(DEVICE_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Device not initialized. Run 'phonelink init' first.")?;
        serde_json::from_str(&contents).context("Invalid device identity")
    }

    /// Save the identity to a data directory.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(DEVICE_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, contents)
            .await
            .context("Failed to save device identity")?;
        set_file_permissions_0600(&path).await?;
        Ok(())
    }

    /// Check if the device is initialized.
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join(DEVICE_FILE).exists()
    }
}

/// Engine configuration from the data directory, or defaults when absent.
pub fn load_config(data_dir: &Path) -> Result<Config> {
    let path = data_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(Config::default());
    }
    Config::from_file(&path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Write the engine configuration.
pub async fn save_config(data_dir: &Path, config: &Config) -> Result<PathBuf> {
    let path = data_dir.join(CONFIG_FILE);
    let contents = config.to_toml().context("Failed to encode configuration")?;
    tokio::fs::write(&path, contents)
        .await
        .context("Failed to save configuration")?;
    Ok(path)
}

/// The key store of this installation.
pub fn key_store(data_dir: &Path) -> FileKeyStore {
    FileKeyStore::new(data_dir.join(KEYS_FILE))
}

/// Random lowercase hex of `bytes` bytes.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    getrandom::getrandom(&mut buf).expect("getrandom failed");
    hex::encode(buf)
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn identity_roundtrip() {
        let dir = tempdir().unwrap();
        let identity = DeviceIdentity::new("Laptop", Role::Device, Some(Platform::Macos));
        identity.save(dir.path()).await.unwrap();

        let loaded = DeviceIdentity::load(dir.path()).await.unwrap();
        assert_eq!(loaded.device_id, identity.device_id);
        assert_eq!(loaded.role, Role::Device);
        assert_eq!(loaded.platform, Some(Platform::Macos));
    }

    #[tokio::test]
    async fn missing_identity_explains_next_step() {
        let dir = tempdir().unwrap();
        let err = DeviceIdentity::load(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("phonelink init"));
    }

    #[tokio::test]
    async fn missing_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.device.name = "Pixel".into();
        config.log.level = "debug".into();
        save_config(dir.path(), &config).await.unwrap();

        assert_eq!(load_config(dir.path()).unwrap(), config);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn identity_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        DeviceIdentity::new("x", Role::Host, None)
            .save(dir.path())
            .await
            .unwrap();

        let path = dir.path().join(DEVICE_FILE);
        let perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600, "file should be 0600");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn data_dir_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("test-data");
        tokio::fs::create_dir_all(&data_dir).await.unwrap();
        set_dir_permissions_0700(&data_dir).await.unwrap();

        let perms = tokio::fs::metadata(&data_dir).await.unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o700, "dir should be 0700");
    }
}
