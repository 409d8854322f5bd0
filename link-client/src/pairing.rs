//! Pairing coordinator and key distribution.
//!
//! Host side (the phone):
//! - scans a QR payload and tracks the session in a [`SessionRegistry`]
//! - approves or rejects through the backend's `completePairing` procedure
//! - right after approval, seals the sync-group [`KeyBundle`] for the new
//!   device and writes it to `e2ee_key_responses/{deviceId}`
//! - answers legacy `e2ee_key_requests` the same way
//!
//! Device side: [`request_key_bundle`] and [`receive_key_bundle`].
//!
//! Every per-user path is built from the transport's authenticated session
//! uid, never from a uid returned by the backend.

use std::sync::Arc;
use std::time::Duration;

use link_core::{
    check_device_limit, PairingOutcome, PairingQrPayload, SessionError, SessionRegistry,
    UsageCheck,
};
use link_types::{
    now_millis, Device, DeviceId, EnvelopeVersion, ErrorKind, KeyBundle, KeyRequest,
    KeyResponse, LinkError, PublicKey, StoragePaths, SyncGroupId, UserId,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cache::SyncCaches;
use crate::config::PairingConfig;
use crate::crypto::{open_sealed, seal_for, CryptoError, KeyPair};
use crate::keystore::{KeyStore, KeyStoreError, SyncGroupKey};
use crate::shutdown::Shutdown;
use crate::transport::{read_optional, ChildEvent, SyncTransport, TransportError};

/// Backend procedure that completes a pairing.
pub const COMPLETE_PAIRING: &str = "completePairing";

/// Backend procedure that reports device usage.
pub const GET_DEVICE_INFO: &str = "getDeviceInfo";

/// Pairing errors.
#[derive(Debug, Error)]
pub enum PairingError {
    /// Session state error (expired, already resolved, bad QR payload).
    #[error("pairing session: {0}")]
    Session(#[from] SessionError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Key store error.
    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Document or bundle encoding error.
    #[error("document error: {0}")]
    Document(#[from] LinkError),

    /// The account already has the maximum number of paired devices.
    #[error("device limit reached ({current}/{limit})")]
    DeviceLimitReached {
        /// Devices currently paired.
        current: u32,
        /// Plan limit.
        limit: u32,
    },

    /// The backend refused for another reason.
    #[error("backend refused pairing: {0}")]
    Backend(String),

    /// Pushing the key bundle took too long.
    #[error("key push timed out")]
    KeyPushTimeout,

    /// No key response has been written for this device yet.
    #[error("no key response available")]
    NoKeyResponse,

    /// No authenticated session.
    #[error("not signed in")]
    SignedOut,
}

impl PairingError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PairingError::Session(e) => e.kind(),
            PairingError::Transport(e) => e.kind(),
            PairingError::KeyStore(_) => ErrorKind::Transient,
            PairingError::Crypto(e) => e.kind(),
            PairingError::Document(e) => e.kind(),
            PairingError::DeviceLimitReached { .. } | PairingError::SignedOut => ErrorKind::Policy,
            PairingError::Backend(_) => ErrorKind::Protocol,
            PairingError::KeyPushTimeout | PairingError::NoKeyResponse => ErrorKind::Transient,
        }
    }
}

/// Result of an approval that the backend accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    /// Id assigned to the new device.
    pub device_id: DeviceId,
    /// User id reported by the backend.
    pub user_id: UserId,
    /// The device was already paired before.
    pub is_re_pairing: bool,
    /// The key bundle reached the store.
    pub key_pushed: bool,
}

/// What `approve` led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalResult {
    /// Paired.
    Approved(Approval),
    /// The backend rejected the request.
    Rejected,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInfo {
    device_count: u32,
    device_limit: u32,
}

/// Host-side pairing and key distribution.
pub struct PairingCoordinator {
    transport: Arc<dyn SyncTransport>,
    keys: Arc<dyn KeyStore>,
    caches: Arc<SyncCaches>,
    registry: Mutex<SessionRegistry>,
    key_push_timeout: Duration,
}

impl PairingCoordinator {
    /// Create a coordinator.
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        keys: Arc<dyn KeyStore>,
        caches: Arc<SyncCaches>,
        config: &PairingConfig,
    ) -> Self {
        Self {
            transport,
            keys,
            caches,
            registry: Mutex::new(SessionRegistry::new(config.session_window())),
            key_push_timeout: config.key_push_timeout(),
        }
    }

    fn paths(&self) -> Result<StoragePaths, PairingError> {
        self.transport
            .session_user_id()
            .map(|uid| StoragePaths::for_user(&uid))
            .ok_or(PairingError::SignedOut)
    }

    /// Parse a scanned QR code and register its session.
    pub async fn scan(&self, qr_text: &str) -> Result<PairingQrPayload, PairingError> {
        let payload = PairingQrPayload::parse(qr_text)?;
        self.registry.lock().await.observe(&payload, now_millis())?;
        debug!(platform = %payload.platform, "Pairing QR scanned");
        Ok(payload)
    }

    /// Approve a pairing request and push the key bundle to the new device.
    ///
    /// Expired sessions are refused locally without calling the backend.
    pub async fn approve(&self, payload: &PairingQrPayload) -> Result<ApprovalResult, PairingError> {
        // Seal for the key registered at scan time.
        let device_key = {
            let mut registry = self.registry.lock().await;
            let session = registry.observe(payload, now_millis())?;
            if session.requested_public_key != payload.public_key {
                warn!("Payload key differs from the scanned session; using the scanned key");
            }
            session.requested_public_key
        };

        let result = self
            .transport
            .call(
                COMPLETE_PAIRING,
                json!({"token": payload.token, "approved": true}),
            )
            .await?;
        let outcome = PairingOutcome::from_value(result)?;

        match outcome {
            PairingOutcome::Approved {
                device_id,
                user_id,
                is_re_pairing,
            } => {
                self.registry.lock().await.resolve(&payload.token, true)?;
                info!(device = %device_id, is_re_pairing, "Pairing approved");

                let key_pushed = match self.push_key_bundle(&device_id, &device_key).await {
                    Ok(()) => true,
                    Err(e) => {
                        // The device can still pull through e2ee_key_requests.
                        warn!(device = %device_id, error = %e, "Key push after approval failed");
                        false
                    }
                };
                if let Some(count) = self.caches.device_count() {
                    if !is_re_pairing {
                        self.caches.set_device_count(count + 1);
                    }
                }

                Ok(ApprovalResult::Approved(Approval {
                    device_id,
                    user_id,
                    is_re_pairing,
                    key_pushed,
                }))
            }
            PairingOutcome::Rejected => {
                self.registry.lock().await.resolve(&payload.token, false)?;
                info!("Pairing rejected by backend");
                Ok(ApprovalResult::Rejected)
            }
            outcome @ PairingOutcome::Error { .. } => {
                if let Some((current, limit)) = outcome.device_limit() {
                    warn!(current, limit, "Pairing refused: device limit reached");
                    self.caches.set_device_count(current);
                    return Err(PairingError::DeviceLimitReached { current, limit });
                }
                let reason = match outcome {
                    PairingOutcome::Error { reason, .. } => reason,
                    _ => String::new(),
                };
                Err(PairingError::Backend(reason))
            }
        }
    }

    /// Reject a pairing request.
    pub async fn reject(&self, payload: &PairingQrPayload) -> Result<(), PairingError> {
        self.registry
            .lock()
            .await
            .observe(payload, now_millis())?;

        self.transport
            .call(
                COMPLETE_PAIRING,
                json!({"token": payload.token, "approved": false}),
            )
            .await?;
        self.registry.lock().await.resolve(&payload.token, false)?;
        info!("Pairing rejected");
        Ok(())
    }

    /// Drop sessions that can no longer matter.
    pub async fn prune_sessions(&self) -> usize {
        self.registry.lock().await.prune(now_millis())
    }

    /// The sync-group key, generated and stored on first use.
    pub async fn ensure_group_key(&self) -> Result<SyncGroupKey, PairingError> {
        if let Some(key) = self.keys.group_key().await? {
            return Ok(key);
        }
        let key = SyncGroupKey {
            id: new_group_id(),
            keypair: KeyPair::generate(),
        };
        self.keys.set_group_key(key.clone()).await?;
        info!(group = %key.id, "Generated sync-group key");
        Ok(key)
    }

    /// Seal the sync-group bundle for `requester` and write it to
    /// `e2ee_key_responses/{device_id}`.
    pub async fn push_key_bundle(
        &self,
        device_id: &DeviceId,
        requester: &PublicKey,
    ) -> Result<(), PairingError> {
        let paths = self.paths()?;
        let group = self.ensure_group_key().await?;

        let bundle = group
            .keypair
            .to_bundle(EnvelopeVersion::V3, Some(group.id.clone()));
        let bytes = Zeroizing::new(bundle.to_bytes()?);
        let sealed = seal_for(requester, &bytes)?;

        let response = KeyResponse {
            key_version: EnvelopeVersion::V3,
            sync_group_id: Some(group.id),
            wrapped_key: sealed.wrapped_key,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            created_at: now_millis(),
        };
        let value = serde_json::to_value(&response).map_err(LinkError::from)?;

        let response_path = paths.key_response(device_id);
        let write = self
            .transport
            .write(&response_path, device_id.as_str(), value);
        tokio::time::timeout(self.key_push_timeout, write)
            .await
            .map_err(|_| PairingError::KeyPushTimeout)??;

        info!(device = %device_id, "Key bundle pushed");
        Ok(())
    }

    /// Answer a legacy key request, then remove it.
    pub async fn handle_key_request(&self, request: &KeyRequest) -> Result<(), PairingError> {
        self.push_key_bundle(&request.requester_device_id, &request.requester_public_key)
            .await?;
        let paths = self.paths()?;
        self.transport
            .delete(&paths.key_request(&request.requester_device_id))
            .await?;
        Ok(())
    }

    /// Consume `e2ee_key_requests` until shutdown.
    pub async fn run_key_request_listener(&self, shutdown: Shutdown) -> Result<(), PairingError> {
        let paths = self.paths()?;
        let mut stream = self.transport.listen_children(&paths.key_requests()).await?;
        info!("Key request listener started");

        loop {
            let event = tokio::select! {
                _ = shutdown.wait() => break,
                event = stream.next() => event,
            };
            let (key, value) = match event {
                Some(ChildEvent::Added { key, value }) | Some(ChildEvent::Changed { key, value }) => {
                    (key, value)
                }
                Some(ChildEvent::Removed { .. }) => continue,
                None => break,
            };

            match serde_json::from_value::<KeyRequest>(value) {
                Ok(request) => {
                    if let Err(e) = self.handle_key_request(&request).await {
                        warn!(request = %key, error = %e, "Key request failed");
                    }
                }
                Err(e) => warn!(request = %key, error = %e, "Ignoring malformed key request"),
            }
        }

        info!("Key request listener stopped");
        Ok(())
    }

    /// Current device usage from the backend.
    pub async fn device_usage(&self) -> Result<UsageCheck, PairingError> {
        let result = self.transport.call(GET_DEVICE_INFO, json!({})).await?;
        let info: DeviceInfo = serde_json::from_value(result).map_err(LinkError::from)?;
        self.caches.set_device_count(info.device_count);
        Ok(check_device_limit(info.device_count, info.device_limit))
    }

    /// Paired devices. Entries for the host platform are dropped.
    pub async fn list_devices(&self) -> Result<Vec<Device>, PairingError> {
        let paths = self.paths()?;
        let children = self.transport.list_children(&paths.devices()).await?;

        let mut devices = Vec::with_capacity(children.len());
        for (key, value) in children {
            if is_host_entry(&value) {
                debug!(device = %key, "Skipping host device entry");
                continue;
            }
            match serde_json::from_value::<Device>(value) {
                Ok(device) => devices.push(device),
                Err(e) => warn!(device = %key, error = %e, "Ignoring unreadable device"),
            }
        }
        self.caches.set_device_count(devices.len() as u32);
        Ok(devices)
    }
}

fn is_host_entry(value: &Value) -> bool {
    value
        .get("platform")
        .and_then(Value::as_str)
        .map(|p| p.eq_ignore_ascii_case("android"))
        .unwrap_or(false)
}

fn new_group_id() -> SyncGroupId {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    SyncGroupId::new(hex::encode(bytes))
}

// ============================================================================
// Device side
// ============================================================================

/// Ask the host for key material (legacy pull path).
pub async fn request_key_bundle(
    transport: &dyn SyncTransport,
    device_id: &DeviceId,
    public_key: PublicKey,
) -> Result<(), PairingError> {
    let uid = transport.session_user_id().ok_or(PairingError::SignedOut)?;
    let paths = StoragePaths::for_user(&uid);
    let request = KeyRequest {
        requester_device_id: device_id.clone(),
        requester_public_key: public_key,
        timestamp: now_millis(),
    };
    let value = serde_json::to_value(&request).map_err(LinkError::from)?;
    transport
        .write(&paths.key_request(device_id), device_id.as_str(), value)
        .await?;
    Ok(())
}

/// Open a key response with this device's private key.
pub fn open_key_response(
    response: &KeyResponse,
    device_key: &KeyPair,
) -> Result<KeyBundle, PairingError> {
    let bytes = open_sealed(
        device_key,
        &response.wrapped_key,
        &response.nonce,
        &response.ciphertext,
    )?;
    let bundle = KeyBundle::from_bytes(&bytes)?;
    if bundle.version != response.key_version {
        return Err(LinkError::InvalidData(format!(
            "bundle version {:?} does not match response version {:?}",
            bundle.version, response.key_version
        ))
        .into());
    }
    Ok(bundle)
}

/// Fetch, open and install the key bundle pushed for this device.
pub async fn receive_key_bundle(
    transport: &dyn SyncTransport,
    keys: &dyn KeyStore,
    device_id: &DeviceId,
    device_key: &KeyPair,
) -> Result<SyncGroupKey, PairingError> {
    let uid = transport.session_user_id().ok_or(PairingError::SignedOut)?;
    let paths = StoragePaths::for_user(&uid);

    let value = read_optional(transport, &paths.key_response(device_id))
        .await?
        .ok_or(PairingError::NoKeyResponse)?;
    let response: KeyResponse = serde_json::from_value(value).map_err(LinkError::from)?;
    let bundle = open_key_response(&response, device_key)?;

    let id = match (bundle.version, bundle.sync_group_id.clone()) {
        (EnvelopeVersion::V3, Some(id)) => id,
        (version, _) => return Err(LinkError::UnsupportedVersion(version.into()).into()),
    };
    let key = SyncGroupKey {
        id,
        keypair: KeyPair::from_bundle(&bundle)?,
    };
    keys.set_group_key(key.clone()).await?;
    info!(group = %key.id, "Installed sync-group key");
    Ok(key)
}
