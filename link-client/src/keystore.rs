//! Local key storage.
//!
//! A phone holds its own device keypair and, once E2EE has been set up, the
//! sync-group keypair shared by every device of the user. Fetching either is
//! an async operation because real platforms keep them in secure storage.

use crate::crypto::{CryptoError, KeyPair};
use async_trait::async_trait;
use link_types::{b64, DeviceId, SyncGroupId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Key store errors.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Reading or writing the backing file failed.
    #[error("key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file is not valid JSON.
    #[error("key file is malformed: {0}")]
    Format(#[from] serde_json::Error),

    /// A stored key could not be decoded.
    #[error("stored key is invalid: {0}")]
    InvalidKey(String),

    /// A stored key has the wrong length.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The sync-group keypair with the id of its group.
#[derive(Debug, Clone)]
pub struct SyncGroupKey {
    /// Sync group id.
    pub id: SyncGroupId,
    /// Shared keypair.
    pub keypair: KeyPair,
}

/// Every key a device can decrypt with.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    /// This device's id and keypair (legacy v2 envelopes, key bundles).
    pub device: Option<(DeviceId, KeyPair)>,
    /// The sync-group key (v3 envelopes).
    pub group: Option<SyncGroupKey>,
}

/// Secure storage for key material.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// This device's keypair.
    async fn device_key(&self) -> Result<Option<KeyPair>, KeyStoreError>;

    /// Store this device's keypair.
    async fn set_device_key(&self, key: KeyPair) -> Result<(), KeyStoreError>;

    /// The sync-group keypair.
    async fn group_key(&self) -> Result<Option<SyncGroupKey>, KeyStoreError>;

    /// Store the sync-group keypair.
    async fn set_group_key(&self, key: SyncGroupKey) -> Result<(), KeyStoreError>;

    /// Forget all key material.
    async fn clear(&self) -> Result<(), KeyStoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    device: Option<KeyPair>,
    group: Option<SyncGroupKey>,
}

/// In-memory key store (tests, demos, short-lived hosts).
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding a group key.
    pub fn with_group_key(key: SyncGroupKey) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner {
                device: None,
                group: Some(key),
            })),
        }
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn device_key(&self) -> Result<Option<KeyPair>, KeyStoreError> {
        Ok(self.inner.read().await.device.clone())
    }

    async fn set_device_key(&self, key: KeyPair) -> Result<(), KeyStoreError> {
        self.inner.write().await.device = Some(key);
        Ok(())
    }

    async fn group_key(&self) -> Result<Option<SyncGroupKey>, KeyStoreError> {
        Ok(self.inner.read().await.group.clone())
    }

    async fn set_group_key(&self, key: SyncGroupKey) -> Result<(), KeyStoreError> {
        self.inner.write().await.group = Some(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), KeyStoreError> {
        let mut inner = self.inner.write().await;
        inner.device = None;
        inner.group = None;
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

/// On-disk layout of `keys.json`. Private keys are base64.
#[derive(Default, Serialize, Deserialize)]
struct KeyFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sync_group_id: Option<SyncGroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_private_key: Option<String>,
}

/// Key store backed by a JSON file with owner-only permissions.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl FileKeyStore {
    /// Use the key file at `path` (created on first write).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// Path of the key file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<KeyFile, KeyStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let bytes = Zeroizing::new(bytes);
                Ok(serde_json::from_slice(&bytes)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KeyFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, file: &KeyFile) -> Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = Zeroizing::new(serde_json::to_vec_pretty(file)?);
        tokio::fs::write(&self.path, json.as_slice()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        Ok(())
    }

    async fn update<F>(&self, f: F) -> Result<(), KeyStoreError>
    where
        F: FnOnce(&mut KeyFile) + Send,
    {
        let _guard = self.lock.write().await;
        let mut file = self.load().await?;
        f(&mut file);
        self.save(&file).await
    }
}

fn decode_pair(encoded: &str) -> Result<KeyPair, KeyStoreError> {
    let bytes = Zeroizing::new(
        b64::decode(encoded).map_err(|e| KeyStoreError::InvalidKey(e.to_string()))?,
    );
    Ok(KeyPair::from_private_bytes(&bytes)?)
}

fn encode_pair(pair: &KeyPair) -> String {
    b64::encode(pair.private_bytes().as_slice())
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn device_key(&self) -> Result<Option<KeyPair>, KeyStoreError> {
        let _guard = self.lock.read().await;
        let file = self.load().await?;
        file.device_private_key.as_deref().map(decode_pair).transpose()
    }

    async fn set_device_key(&self, key: KeyPair) -> Result<(), KeyStoreError> {
        let encoded = encode_pair(&key);
        self.update(move |f| f.device_private_key = Some(encoded)).await
    }

    async fn group_key(&self) -> Result<Option<SyncGroupKey>, KeyStoreError> {
        let _guard = self.lock.read().await;
        let file = self.load().await?;
        match (file.sync_group_id, file.group_private_key.as_deref()) {
            (Some(id), Some(encoded)) => Ok(Some(SyncGroupKey {
                id,
                keypair: decode_pair(encoded)?,
            })),
            _ => Ok(None),
        }
    }

    async fn set_group_key(&self, key: SyncGroupKey) -> Result<(), KeyStoreError> {
        let encoded = encode_pair(&key.keypair);
        let id = key.id;
        self.update(move |f| {
            f.sync_group_id = Some(id);
            f.group_private_key = Some(encoded);
        })
        .await
    }

    async fn clear(&self) -> Result<(), KeyStoreError> {
        self.update(|f| *f = KeyFile::default()).await
    }
}

/// Gather everything this device can decrypt with.
pub async fn load_keyring(
    store: &dyn KeyStore,
    device_id: Option<DeviceId>,
) -> Result<Keyring, KeyStoreError> {
    let device = match (device_id, store.device_key().await?) {
        (Some(id), Some(pair)) => Some((id, pair)),
        _ => None,
    };
    Ok(Keyring {
        device,
        group: store.group_key().await?,
    })
}
