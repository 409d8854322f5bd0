//! A phone and its paired devices sharing one in-memory backend.
//!
//! [`FakeBackend`] registers the `completePairing` and `getDeviceInfo`
//! procedures on a [`MockTransport`] and writes `devices/{id}` documents the
//! way the real backend does. [`Phone`] wires the host-side components and
//! [`Desktop`] plays a paired client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use link_client::envelope::open_document;
use link_client::keystore::load_keyring;
use link_client::pairing::{COMPLETE_PAIRING, GET_DEVICE_INFO};
use link_client::{
    receive_key_bundle, request_key_bundle, CallStateReconciler, EnvelopeError, KeyPair, KeyStore,
    MemoryKeyStore, MessageSyncEngine, MockTransport, MockUploader, PairingCoordinator,
    PairingError, SyncCaches, SyncGroupKey, SyncOptions, TelephonyControl,
};
use link_client::config::{CallsConfig, PairingConfig};
use link_core::{PairingQrPayload, RetryPolicy, SessionError, TelephonyAction};
use link_types::{Device, DeviceId, MessageKey, Platform, PublicKey};
use serde_json::{json, Value};

/// Account every party signs in to.
pub const USER: &str = "user-1";

/// Default plan limit of the fake backend.
pub const DEFAULT_DEVICE_LIMIT: u32 = 3;

struct PendingDevice {
    name: String,
    platform: Platform,
    public_key: PublicKey,
}

/// Backend procedures on top of a shared [`MockTransport`].
#[derive(Clone)]
pub struct FakeBackend {
    transport: MockTransport,
    pending: Arc<Mutex<HashMap<String, PendingDevice>>>,
}

impl FakeBackend {
    /// A signed-in backend with the given device limit.
    pub fn new(device_limit: u32) -> Self {
        let transport = MockTransport::signed_in(USER);
        let pending: Arc<Mutex<HashMap<String, PendingDevice>>> = Arc::default();

        let store = transport.clone();
        let tokens = pending.clone();
        transport.on_call(COMPLETE_PAIRING, move |args| {
            let token = args["token"].as_str().unwrap_or_default().to_string();
            let approved = args["approved"].as_bool().unwrap_or(false);

            let mut tokens = tokens.lock().unwrap();
            let Some(device) = tokens.get(&token) else {
                return Ok(json!({"status": "error", "reason": "token_unknown"}));
            };
            if !approved {
                tokens.remove(&token);
                return Ok(json!({"status": "rejected"}));
            }

            let devices = store.children(&devices_path());
            let current = devices.len() as u32;
            if current >= device_limit {
                return Ok(json!({
                    "status": "error",
                    "reason": "device_limit",
                    "currentDevices": current,
                    "limit": device_limit,
                }));
            }

            let id = DeviceId::new(format!("{}-{}", device.platform.as_str(), current + 1));
            let doc = Device {
                id: id.clone(),
                display_name: device.name.clone(),
                platform: device.platform,
                public_key: Some(device.public_key),
                last_seen: link_types::now_millis(),
            };
            store.seed(
                &format!("{}/{}", devices_path(), id),
                serde_json::to_value(&doc).unwrap(),
            );
            tokens.remove(&token);
            Ok(json!({"status": "approved", "deviceId": id.as_str(), "userId": USER}))
        });

        let store = transport.clone();
        transport.on_call(GET_DEVICE_INFO, move |_| {
            let count = store.children(&devices_path()).len();
            Ok(json!({"deviceCount": count, "deviceLimit": device_limit}))
        });

        Self { transport, pending }
    }

    /// The shared transport.
    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Issue a pairing token for a device, as the backend does before the
    /// device renders its QR code.
    pub fn issue_token(&self, token: &str, name: &str, platform: Platform, public_key: PublicKey) {
        self.pending.lock().unwrap().insert(
            token.to_string(),
            PendingDevice {
                name: name.to_string(),
                platform,
                public_key,
            },
        );
    }

    /// Paired device documents.
    pub fn devices(&self) -> Vec<(String, Value)> {
        self.transport.children(&devices_path())
    }
}

fn devices_path() -> String {
    format!("users/{}/devices", USER)
}

/// Telephony layer that records what it was asked to do.
#[derive(Default)]
pub struct RecordingTelephony {
    actions: Mutex<Vec<TelephonyAction>>,
}

impl RecordingTelephony {
    /// Actions performed so far.
    pub fn actions(&self) -> Vec<TelephonyAction> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelephonyControl for RecordingTelephony {
    async fn accept_ringing_call(&self) -> Result<(), String> {
        self.actions
            .lock()
            .unwrap()
            .push(TelephonyAction::AcceptRingingCall);
        Ok(())
    }

    async fn end_call(&self) -> Result<(), String> {
        self.actions.lock().unwrap().push(TelephonyAction::EndCall);
        Ok(())
    }
}

/// The host phone.
pub struct Phone {
    /// Transport shared with the backend.
    pub transport: MockTransport,
    /// Attachment uploads.
    pub uploader: MockUploader,
    /// Phone key store.
    pub keys: MemoryKeyStore,
    /// Shared caches.
    pub caches: Arc<SyncCaches>,
    /// Pairing and key distribution.
    pub pairing: Arc<PairingCoordinator>,
    /// Message sync.
    pub sync: MessageSyncEngine,
    /// Call state.
    pub calls: Arc<CallStateReconciler>,
    /// Telephony recorder.
    pub telephony: Arc<RecordingTelephony>,
}

impl Phone {
    /// Wire a phone against `backend`.
    pub fn new(backend: &FakeBackend) -> Self {
        let transport = backend.transport().clone();
        let uploader = MockUploader::new();
        let keys = MemoryKeyStore::new();
        let caches = Arc::new(SyncCaches::new());
        let telephony = Arc::new(RecordingTelephony::default());

        let pairing = Arc::new(PairingCoordinator::new(
            Arc::new(transport.clone()),
            Arc::new(keys.clone()),
            caches.clone(),
            &PairingConfig::default(),
        ));
        let sync = MessageSyncEngine::new(
            Arc::new(transport.clone()),
            Arc::new(uploader.clone()),
            Arc::new(keys.clone()),
            caches.clone(),
            SyncOptions {
                own_numbers: vec!["+15550001111".into()],
                batch_delay: Duration::ZERO,
                retry: RetryPolicy::immediate(3),
                ..SyncOptions::default()
            },
        );
        let calls = Arc::new(CallStateReconciler::new(
            Arc::new(transport.clone()),
            telephony.clone(),
            CallsConfig::default(),
        ));

        Self {
            transport,
            uploader,
            keys,
            caches,
            pairing,
            sync,
            calls,
            telephony,
        }
    }

    /// Scan and approve a device's QR code.
    pub async fn pair(&self, desktop: &mut Desktop) -> Result<DeviceId, PairingError> {
        let payload = self.pairing.scan(&desktop.qr_text()?).await?;
        match self.pairing.approve(&payload).await? {
            link_client::ApprovalResult::Approved(approval) => {
                desktop.device_id = Some(approval.device_id.clone());
                Ok(approval.device_id)
            }
            link_client::ApprovalResult::Rejected => {
                Err(PairingError::Backend("rejected".into()))
            }
        }
    }
}

/// A paired client.
pub struct Desktop {
    /// Display name.
    pub name: String,
    /// Platform.
    pub platform: Platform,
    /// Device keypair.
    pub keypair: KeyPair,
    /// Device key store.
    pub keys: MemoryKeyStore,
    /// Assigned id once paired.
    pub device_id: Option<DeviceId>,
    /// Transport shared with the backend.
    pub transport: MockTransport,
    token: String,
}

impl Desktop {
    /// A new unpaired device with a pairing token issued by `backend`.
    pub async fn new(backend: &FakeBackend, name: &str, platform: Platform) -> Self {
        let keypair = KeyPair::generate();
        let keys = MemoryKeyStore::new();
        keys.set_device_key(keypair.clone()).await.unwrap();

        let token = format!("tok-{}", name.to_lowercase().replace(' ', "-"));
        backend.issue_token(&token, name, platform, keypair.public_key());

        Self {
            name: name.to_string(),
            platform,
            keypair,
            keys,
            device_id: None,
            transport: backend.transport().clone(),
            token,
        }
    }

    /// The QR code text this device displays.
    pub fn qr_text(&self) -> Result<String, SessionError> {
        PairingQrPayload {
            token: self.token.clone(),
            name: self.name.clone(),
            platform: self.platform,
            version: 2,
            public_key: self.keypair.public_key(),
            sync_group_id: None,
        }
        .to_json()
    }

    fn id(&self) -> DeviceId {
        self.device_id
            .clone()
            .unwrap_or_else(|| DeviceId::new(format!("unpaired-{}", self.name)))
    }

    /// Open the pushed key bundle and install the sync-group key.
    pub async fn receive_keys(&self) -> Result<SyncGroupKey, PairingError> {
        receive_key_bundle(&self.transport, &self.keys, &self.id(), &self.keypair).await
    }

    /// Ask the phone for keys through `e2ee_key_requests`.
    pub async fn request_keys(&self) -> Result<(), PairingError> {
        request_key_bundle(&self.transport, &self.id(), self.keypair.public_key()).await
    }

    /// Raw message document.
    pub fn message_doc(&self, key: &MessageKey) -> Option<Value> {
        self.transport
            .doc(&format!("users/{}/messages/{}", USER, key))
    }

    /// Decrypt a synced message body with whatever keys this device holds.
    pub async fn read_message(&self, key: &MessageKey) -> Result<String, EnvelopeError> {
        let doc = self
            .message_doc(key)
            .ok_or_else(|| EnvelopeError::Malformed(format!("no message {}", key)))?;
        let keyring = load_keyring(&self.keys, self.device_id.clone())
            .await
            .map_err(|_| EnvelopeError::EncryptionUnavailable("key store unreadable"))?;
        open_document(&doc, &keyring)
    }
}
