//! Message body envelopes.
//!
//! Every message body is encrypted under a fresh [`DataKey`]; the data key is
//! then wrapped for whoever should be able to read it:
//! - **v3**: once, for the sync-group public key shared by all of the user's
//!   devices (`e2eeEnvelope`)
//! - **v2**: once per known device public key (`keyMap[deviceId]`)
//!
//! Sealing prefers v3 and falls back to v2 when no group key is known.
//! Opening selects a [`DecryptionStrategy`] by envelope version, so a reader
//! that only holds keys for one generation fails cleanly on the other.
//!
//! When a body cannot be sealed at all, the record is turned into a redacted
//! placeholder rather than being dropped or stored in the clear.

use crate::crypto::{self, CryptoError, DataKey, NONCE_SIZE};
use crate::keystore::Keyring;
use link_types::{
    b64, DeviceId, EnvelopeVersion, ErrorKind, FailureReason, MessageRecord, OutgoingMessage,
    PublicKey, SyncGroupId, WrappedKey, ENCRYPTED_PLACEHOLDER,
};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Envelope errors. All are recoverable: the affected message is unreadable
/// (or stored as a placeholder), nothing else.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// No local key material to seal or open with.
    #[error("encryption unavailable: {0}")]
    EncryptionUnavailable(&'static str),

    /// No recipient wrap succeeded.
    #[error("key wrap failed for all {attempted} recipient(s)")]
    WrapFailed {
        /// Number of recipients tried.
        attempted: usize,
    },

    /// Symmetric encryption of the body failed.
    #[error("body encryption failed: {0}")]
    EncryptFailed(#[source] CryptoError),

    /// Wrong key, corrupted ciphertext or envelope.
    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    /// The envelope belongs to a protocol generation we cannot read.
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    /// Envelope fields are missing or inconsistent.
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl EnvelopeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }

    /// Reason recorded on a placeholder record, for sealing errors.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            EnvelopeError::EncryptionUnavailable(_) => FailureReason::EncryptionUnavailable,
            EnvelopeError::WrapFailed { .. } => FailureReason::WrapFailed,
            _ => FailureReason::EncryptFailed,
        }
    }
}

impl From<CryptoError> for EnvelopeError {
    fn from(err: CryptoError) -> Self {
        EnvelopeError::DecryptFailed(err.to_string())
    }
}

// ============================================================================
// Sealing
// ============================================================================

/// Who a body is sealed for.
#[derive(Debug, Clone, Default)]
pub struct Recipients {
    /// Sync-group id and public key (v3).
    pub group: Option<(SyncGroupId, PublicKey)>,
    /// Known device public keys (v2 fallback).
    pub devices: Vec<(DeviceId, PublicKey)>,
}

impl Recipients {
    /// Seal for the sync group only.
    pub fn group(id: SyncGroupId, public_key: PublicKey) -> Self {
        Self {
            group: Some((id, public_key)),
            devices: Vec::new(),
        }
    }

    /// Seal for individual devices only.
    pub fn devices(devices: Vec<(DeviceId, PublicKey)>) -> Self {
        Self {
            group: None,
            devices,
        }
    }

    /// Whether there is anyone to seal for.
    pub fn is_empty(&self) -> bool {
        self.group.is_none() && self.devices.is_empty()
    }
}

/// How the data key of a sealed body was wrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wrapping {
    /// v2: one wrap per device.
    DeviceMap(BTreeMap<DeviceId, WrappedKey>),
    /// v3: one wrap for the sync group.
    SyncGroup {
        /// Group the key was wrapped for.
        target: SyncGroupId,
        /// Wrapped data key.
        envelope: WrappedKey,
    },
}

/// An encrypted body plus its wrapped data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBody {
    /// Body ciphertext.
    pub ciphertext: Vec<u8>,
    /// Body nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Wrapped data key.
    pub wrapping: Wrapping,
}

impl SealedBody {
    /// Protocol generation of this envelope.
    pub fn version(&self) -> EnvelopeVersion {
        match self.wrapping {
            Wrapping::DeviceMap(_) => EnvelopeVersion::V2,
            Wrapping::SyncGroup { .. } => EnvelopeVersion::V3,
        }
    }

    /// Write the sealed body into a message record.
    pub fn apply_to(self, record: &mut MessageRecord) {
        record.key_version = Some(self.version());
        record.body = b64::encode(&self.ciphertext);
        record.encrypted = true;
        record.nonce = Some(self.nonce.to_vec());
        record.e2ee_failed = false;
        record.failure_reason = None;
        match self.wrapping {
            Wrapping::DeviceMap(map) => {
                record.key_map = Some(map);
                record.e2ee_envelope = None;
                record.e2ee_target = None;
            }
            Wrapping::SyncGroup { target, envelope } => {
                record.key_map = None;
                record.e2ee_envelope = Some(envelope);
                record.e2ee_target = Some(target);
            }
        }
    }

    /// Write the sealed body into an outgoing message.
    pub fn apply_to_outgoing(self, message: &mut OutgoingMessage) {
        message.key_version = Some(self.version());
        message.body = b64::encode(&self.ciphertext);
        message.encrypted = true;
        message.nonce = Some(self.nonce.to_vec());
        match self.wrapping {
            Wrapping::DeviceMap(map) => {
                message.key_map = Some(map);
                message.e2ee_envelope = None;
            }
            Wrapping::SyncGroup { envelope, .. } => {
                message.key_map = None;
                message.e2ee_envelope = Some(envelope);
            }
        }
    }
}

fn wrap_for_devices(
    key: &DataKey,
    devices: &[(DeviceId, PublicKey)],
) -> Result<BTreeMap<DeviceId, WrappedKey>, EnvelopeError> {
    let mut map = BTreeMap::new();
    for (device_id, public_key) in devices {
        match crypto::wrap_key(public_key, key) {
            Ok(wrapped) => {
                map.insert(device_id.clone(), wrapped);
            }
            Err(e) => warn!(device = %device_id, error = %e, "Skipping device with unusable key"),
        }
    }
    if map.is_empty() {
        return Err(EnvelopeError::WrapFailed {
            attempted: devices.len(),
        });
    }
    Ok(map)
}

/// Encrypt a body for `recipients` under a fresh data key.
pub fn seal(plaintext: &[u8], recipients: &Recipients) -> Result<SealedBody, EnvelopeError> {
    if recipients.is_empty() {
        return Err(EnvelopeError::EncryptionUnavailable("no recipient keys"));
    }

    let key = DataKey::random();
    let (ciphertext, nonce) = key.encrypt(plaintext).map_err(EnvelopeError::EncryptFailed)?;

    let wrapping = match &recipients.group {
        Some((target, public_key)) => match crypto::wrap_key(public_key, &key) {
            Ok(envelope) => Wrapping::SyncGroup {
                target: target.clone(),
                envelope,
            },
            Err(e) if !recipients.devices.is_empty() => {
                warn!(group = %target, error = %e, "Group wrap failed, falling back to per-device keys");
                Wrapping::DeviceMap(wrap_for_devices(&key, &recipients.devices)?)
            }
            Err(e) => {
                warn!(group = %target, error = %e, "Group wrap failed");
                return Err(EnvelopeError::WrapFailed { attempted: 1 });
            }
        },
        None => Wrapping::DeviceMap(wrap_for_devices(&key, &recipients.devices)?),
    };

    Ok(SealedBody {
        ciphertext,
        nonce,
        wrapping,
    })
}

/// Turn a record into a redacted placeholder.
///
/// The body is replaced, every envelope field cleared.
pub fn redact(record: &mut MessageRecord, reason: FailureReason) {
    record.body = ENCRYPTED_PLACEHOLDER.to_string();
    record.encrypted = false;
    record.nonce = None;
    record.key_map = None;
    record.e2ee_envelope = None;
    record.key_version = None;
    record.e2ee_target = None;
    record.e2ee_failed = true;
    record.failure_reason = Some(reason);
}

/// Seal a plaintext record in place.
///
/// `None` recipients means encryption is unavailable. On any failure the
/// record is redacted and the error returned for logging.
pub fn seal_record(
    record: &mut MessageRecord,
    recipients: Option<&Recipients>,
) -> Result<EnvelopeVersion, EnvelopeError> {
    let result = match recipients {
        Some(r) => seal(record.body.as_bytes(), r),
        None => Err(EnvelopeError::EncryptionUnavailable("keys not initialized")),
    };
    match result {
        Ok(sealed) => {
            let version = sealed.version();
            sealed.apply_to(record);
            Ok(version)
        }
        Err(e) => {
            redact(record, e.failure_reason());
            Err(e)
        }
    }
}

// ============================================================================
// Opening
// ============================================================================

/// The envelope fields of a stored document.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeFields<'a> {
    /// Base64 ciphertext.
    pub body: &'a str,
    /// Body nonce.
    pub nonce: Option<&'a [u8]>,
    /// v2 key map.
    pub key_map: Option<&'a BTreeMap<DeviceId, WrappedKey>>,
    /// v3 envelope.
    pub e2ee_envelope: Option<&'a WrappedKey>,
    /// Declared version.
    pub key_version: Option<EnvelopeVersion>,
    /// v3 target group.
    pub e2ee_target: Option<&'a SyncGroupId>,
}

impl<'a> From<&'a MessageRecord> for EnvelopeFields<'a> {
    fn from(r: &'a MessageRecord) -> Self {
        Self {
            body: &r.body,
            nonce: r.nonce.as_deref(),
            key_map: r.key_map.as_ref(),
            e2ee_envelope: r.e2ee_envelope.as_ref(),
            key_version: r.key_version,
            e2ee_target: r.e2ee_target.as_ref(),
        }
    }
}

impl<'a> From<&'a OutgoingMessage> for EnvelopeFields<'a> {
    fn from(m: &'a OutgoingMessage) -> Self {
        Self {
            body: &m.body,
            nonce: m.nonce.as_deref(),
            key_map: m.key_map.as_ref(),
            e2ee_envelope: m.e2ee_envelope.as_ref(),
            key_version: m.key_version,
            e2ee_target: None,
        }
    }
}

impl EnvelopeFields<'_> {
    /// Declared version, or the one implied by which fields are present.
    pub fn version(&self) -> Result<EnvelopeVersion, EnvelopeError> {
        if let Some(v) = self.key_version {
            return Ok(v);
        }
        match (self.key_map.is_some(), self.e2ee_envelope.is_some()) {
            (false, true) => Ok(EnvelopeVersion::V3),
            (true, false) => Ok(EnvelopeVersion::V2),
            (true, true) => Err(EnvelopeError::Malformed(
                "both keyMap and e2eeEnvelope present".into(),
            )),
            (false, false) => Err(EnvelopeError::Malformed("no wrapped key".into())),
        }
    }
}

/// Recovers the data key of one envelope generation.
pub trait DecryptionStrategy: Send + Sync {
    /// Generation handled.
    fn version(&self) -> EnvelopeVersion;

    /// Unwrap the data key with the keys in `keys`.
    fn unwrap_data_key(
        &self,
        fields: &EnvelopeFields<'_>,
        keys: &Keyring,
    ) -> Result<DataKey, EnvelopeError>;
}

/// Legacy v2: the data key is wrapped once per device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceMapStrategy;

impl DecryptionStrategy for DeviceMapStrategy {
    fn version(&self) -> EnvelopeVersion {
        EnvelopeVersion::V2
    }

    fn unwrap_data_key(
        &self,
        fields: &EnvelopeFields<'_>,
        keys: &Keyring,
    ) -> Result<DataKey, EnvelopeError> {
        let map = fields
            .key_map
            .ok_or_else(|| EnvelopeError::Malformed("v2 envelope without keyMap".into()))?;
        let (device_id, keypair) = keys
            .device
            .as_ref()
            .ok_or(EnvelopeError::EncryptionUnavailable("no device key"))?;
        let wrapped = map.get(device_id).ok_or_else(|| {
            EnvelopeError::DecryptFailed(format!("no wrapped key for device {}", device_id))
        })?;
        Ok(crypto::unwrap_key(keypair, wrapped)?)
    }
}

/// Current v3: the data key is wrapped once for the sync group.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncGroupStrategy;

impl DecryptionStrategy for SyncGroupStrategy {
    fn version(&self) -> EnvelopeVersion {
        EnvelopeVersion::V3
    }

    fn unwrap_data_key(
        &self,
        fields: &EnvelopeFields<'_>,
        keys: &Keyring,
    ) -> Result<DataKey, EnvelopeError> {
        let envelope = fields
            .e2ee_envelope
            .ok_or_else(|| EnvelopeError::Malformed("v3 envelope without e2eeEnvelope".into()))?;
        let group = keys
            .group
            .as_ref()
            .ok_or(EnvelopeError::EncryptionUnavailable("no sync-group key"))?;
        if let Some(target) = fields.e2ee_target {
            if *target != group.id {
                return Err(EnvelopeError::DecryptFailed(format!(
                    "sealed for sync group {}, we hold {}",
                    target, group.id
                )));
            }
        }
        Ok(crypto::unwrap_key(&group.keypair, envelope)?)
    }
}

/// Strategy for a given generation.
pub fn strategy_for(version: EnvelopeVersion) -> &'static dyn DecryptionStrategy {
    match version {
        EnvelopeVersion::V2 => &DeviceMapStrategy,
        EnvelopeVersion::V3 => &SyncGroupStrategy,
    }
}

/// Decrypt the body of a stored document.
pub fn open(fields: EnvelopeFields<'_>, keys: &Keyring) -> Result<String, EnvelopeError> {
    let nonce = fields
        .nonce
        .ok_or_else(|| EnvelopeError::Malformed("missing nonce".into()))?;
    let ciphertext = b64::decode(fields.body)
        .map_err(|e| EnvelopeError::Malformed(format!("body is not base64: {}", e)))?;

    let key = strategy_for(fields.version()?).unwrap_data_key(&fields, keys)?;
    let plaintext = key.decrypt(&ciphertext, nonce)?;
    String::from_utf8(plaintext)
        .map_err(|_| EnvelopeError::DecryptFailed("plaintext is not UTF-8".into()))
}

/// Decrypt a message record.
///
/// Unencrypted records return their body as-is (including placeholders).
pub fn open_record(record: &MessageRecord, keys: &Keyring) -> Result<String, EnvelopeError> {
    if !record.encrypted {
        return Ok(record.body.clone());
    }
    open(record.into(), keys)
}

/// Decrypt a raw message document.
///
/// The declared version is checked before decoding so that documents from a
/// newer protocol generation fail with `UnsupportedVersion`.
pub fn open_document(doc: &Value, keys: &Keyring) -> Result<String, EnvelopeError> {
    if let Some(raw) = doc.get("keyVersion").and_then(Value::as_u64) {
        let raw = u8::try_from(raw).unwrap_or(u8::MAX);
        EnvelopeVersion::try_from(raw).map_err(|_| EnvelopeError::UnsupportedVersion(raw))?;
    }
    let record = MessageRecord::from_value(doc.clone())
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    open_record(&record, keys)
}
