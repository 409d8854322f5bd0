//! Process-wide sync caches.
//!
//! One owning component instead of scattered globals: the message keys
//! already written, the content hashes of attachments already uploaded and
//! the last known device count. Every set is bounded and drops its oldest
//! entry when full. `clear()` runs on sign-out.

use link_core::BoundedIdSet;
use link_types::MessageKey;
use std::collections::HashMap;
use std::sync::Mutex;

/// Default capacity of the synced-key cache.
pub const DEFAULT_SYNCED_KEYS_CAPACITY: usize = 10_000;

/// Default capacity of the uploaded-attachment cache.
pub const DEFAULT_ATTACHMENT_CAPACITY: usize = 1_000;

/// Where an uploaded attachment lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlob {
    /// Storage key.
    pub file_key: String,
    /// Backend file id.
    pub file_id: String,
}

#[derive(Debug)]
struct CacheState {
    synced: BoundedIdSet<MessageKey>,
    attachments: BoundedIdSet<String>,
    blobs: HashMap<String, UploadedBlob>,
    device_count: Option<u32>,
}

/// Shared caches, safe to use from any task.
#[derive(Debug)]
pub struct SyncCaches {
    state: Mutex<CacheState>,
}

impl SyncCaches {
    /// Create caches with default capacities.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SYNCED_KEYS_CAPACITY, DEFAULT_ATTACHMENT_CAPACITY)
    }

    /// Create caches with explicit capacities.
    pub fn with_capacity(synced_keys: usize, attachments: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                synced: BoundedIdSet::new(synced_keys),
                attachments: BoundedIdSet::new(attachments),
                blobs: HashMap::new(),
                device_count: None,
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        // A panic while holding the lock cannot leave a set half-updated.
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Whether the message key has been written.
    pub fn is_synced(&self, key: &MessageKey) -> bool {
        self.with(|s| s.synced.contains(key))
    }

    /// Remember a written message key.
    pub fn mark_synced(&self, key: MessageKey) {
        self.with(|s| {
            s.synced.insert(key);
        });
    }

    /// Number of remembered message keys.
    pub fn synced_count(&self) -> usize {
        self.with(|s| s.synced.len())
    }

    /// The upload of an attachment with this content hash, if any.
    pub fn uploaded(&self, hash: &str) -> Option<UploadedBlob> {
        self.with(|s| s.blobs.get(hash).cloned())
    }

    /// Remember an uploaded attachment by content hash.
    pub fn mark_uploaded(&self, hash: String, blob: UploadedBlob) {
        self.with(|s| {
            if let Some(evicted) = s.attachments.insert_evicting(hash.clone()) {
                s.blobs.remove(&evicted);
            }
            s.blobs.insert(hash, blob);
        });
    }

    /// Last known number of paired devices.
    pub fn device_count(&self) -> Option<u32> {
        self.with(|s| s.device_count)
    }

    /// Update the cached device count.
    pub fn set_device_count(&self, count: u32) {
        self.with(|s| s.device_count = Some(count));
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.with(|s| {
            s.synced.clear();
            s.attachments.clear();
            s.blobs.clear();
            s.device_count = None;
        });
    }
}

impl Default for SyncCaches {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex blake3 hash of attachment bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}
