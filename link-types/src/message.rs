//! Message documents.
//!
//! [`MessageRecord`] is what the phone writes under `messages/{messageKey}`;
//! [`OutgoingMessage`] is what a paired device queues under
//! `outgoing_messages/{id}` for the phone to send.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{DeviceId, EnvelopeVersion, LinkError, MessageKey, SyncGroupId, WrappedKey};

/// Body stored when a message could not be encrypted.
pub const ENCRYPTED_PLACEHOLDER: &str = "[Encrypted]";

/// Direction of a message relative to the phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Arrived on the phone.
    Received,
    /// Sent from the phone.
    Sent,
}

/// Why a message was stored as a redacted placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No local key material (keys not initialized, no paired devices).
    EncryptionUnavailable,
    /// Every recipient wrap failed.
    WrapFailed,
    /// Symmetric encryption of the body failed.
    EncryptFailed,
}

impl FailureReason {
    /// Machine-readable reason string.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::EncryptionUnavailable => "encryption_unavailable",
            FailureReason::WrapFailed => "wrap_failed",
            FailureReason::EncryptFailed => "encrypt_failed",
        }
    }
}

/// An MMS attachment as stored alongside its message.
///
/// Exactly one of `url`+`file_key` (uploaded), `inline_data` (small
/// payload embedded in the document) or neither (metadata only) is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Local part id.
    pub id: String,
    /// MIME type.
    pub content_type: String,
    /// Original file name, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Size of the original payload in bytes.
    pub size: u64,
    /// Blob storage key after a presigned upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    /// Blob storage file id after a presigned upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Inline payload for small attachments when upload is unavailable.
    #[serde(
        default,
        with = "crate::b64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub inline_data: Option<Vec<u8>>,
}

impl Attachment {
    /// Metadata-only attachment (nothing uploaded).
    pub fn metadata(id: &str, content_type: &str, file_name: Option<String>, size: u64) -> Self {
        Self {
            id: id.to_string(),
            content_type: content_type.to_string(),
            file_name,
            size,
            file_key: None,
            file_id: None,
            inline_data: None,
        }
    }

    /// Whether the payload itself was made available to other devices.
    pub fn has_payload(&self) -> bool {
        self.file_key.is_some() || self.inline_data.is_some()
    }
}

/// A synced message document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Storage key (`"<id>"` or `"mms_<id>"`).
    pub id: MessageKey,
    /// Row id in the local message store.
    pub source_id: i64,
    /// Whether the row came from the MMS table.
    pub is_mms: bool,
    /// Local conversation thread id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    /// Resolved conversation partner (never the phone's own number).
    pub address: String,
    /// Message timestamp (Unix ms).
    pub date: u64,
    /// Received or sent.
    pub direction: Direction,
    /// Plaintext, ciphertext (base64) or the placeholder.
    pub body: String,
    /// Whether `body` is ciphertext.
    pub encrypted: bool,
    /// Body nonce (encrypted messages only).
    #[serde(
        default,
        with = "crate::b64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub nonce: Option<Vec<u8>>,
    /// v2: data key wrapped per device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_map: Option<BTreeMap<DeviceId, WrappedKey>>,
    /// v3: data key wrapped for the sync group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2ee_envelope: Option<WrappedKey>,
    /// Envelope generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<EnvelopeVersion>,
    /// Sync group whose key wraps `e2ee_envelope`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2ee_target: Option<SyncGroupId>,
    /// Set when encryption was attempted and failed.
    #[serde(default)]
    pub e2ee_failed: bool,
    /// Why encryption failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// MMS attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl MessageRecord {
    /// Create an unencrypted record. Crypto fields are filled in by the
    /// envelope layer.
    pub fn plaintext(
        source_id: i64,
        is_mms: bool,
        address: &str,
        date: u64,
        direction: Direction,
        body: &str,
    ) -> Self {
        Self {
            id: MessageKey::new(source_id, is_mms),
            source_id,
            is_mms,
            thread_id: None,
            address: address.to_string(),
            date,
            direction,
            body: body.to_string(),
            encrypted: false,
            nonce: None,
            key_map: None,
            e2ee_envelope: None,
            key_version: None,
            e2ee_target: None,
            e2ee_failed: false,
            failure_reason: None,
            attachments: Vec::new(),
        }
    }

    /// Check the structural invariants of the record.
    ///
    /// - `encrypted` implies a nonce and exactly one envelope generation
    /// - an unencrypted record carries no envelope fields
    /// - `e2ee_failed` implies the placeholder body and a reason
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.encrypted {
            if self.nonce.is_none() {
                return Err(LinkError::InvariantViolation(
                    "encrypted message without nonce".into(),
                ));
            }
            match (&self.key_map, &self.e2ee_envelope) {
                (Some(_), Some(_)) => {
                    return Err(LinkError::InvariantViolation(
                        "both keyMap and e2eeEnvelope populated".into(),
                    ))
                }
                (None, None) => {
                    return Err(LinkError::InvariantViolation(
                        "encrypted message without wrapped key".into(),
                    ))
                }
                _ => {}
            }
        } else if self.key_map.is_some() || self.e2ee_envelope.is_some() {
            return Err(LinkError::InvariantViolation(
                "unencrypted message carries wrapped keys".into(),
            ));
        }

        if self.e2ee_failed
            && (self.body != ENCRYPTED_PLACEHOLDER || self.failure_reason.is_none())
        {
            return Err(LinkError::InvariantViolation(
                "failed encryption must store the placeholder and a reason".into(),
            ));
        }

        Ok(())
    }

    /// Encode as a JSON document.
    pub fn to_value(&self) -> Result<Value, LinkError> {
        serde_json::to_value(self).map_err(LinkError::Serialization)
    }

    /// Decode from a JSON document.
    pub fn from_value(value: Value) -> Result<Self, LinkError> {
        serde_json::from_value(value).map_err(LinkError::Serialization)
    }
}

/// A message composed on a paired device, queued for the phone to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Recipient address.
    pub address: String,
    /// Plaintext or ciphertext (base64).
    pub body: String,
    /// When it was queued (Unix ms).
    #[serde(default)]
    pub timestamp: u64,
    /// Whether `body` is ciphertext.
    #[serde(default)]
    pub encrypted: bool,
    /// Body nonce (encrypted only).
    #[serde(
        default,
        with = "crate::b64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub nonce: Option<Vec<u8>>,
    /// v2: data key wrapped per device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_map: Option<BTreeMap<DeviceId, WrappedKey>>,
    /// v3: data key wrapped for the sync group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2ee_envelope: Option<WrappedKey>,
    /// Envelope generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<EnvelopeVersion>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped() -> WrappedKey {
        WrappedKey {
            epk: vec![1; 32],
            nonce: vec![2; 24],
            ct: vec![3; 48],
        }
    }

    #[test]
    fn plaintext_record_is_valid() {
        let record = MessageRecord::plaintext(1, false, "+15550001111", 10, Direction::Sent, "hi");
        assert!(record.validate().is_ok());
        assert_eq!(record.id.as_str(), "1");
    }

    #[test]
    fn encrypted_without_nonce_is_invalid() {
        let mut record = MessageRecord::plaintext(1, false, "a", 0, Direction::Received, "x");
        record.encrypted = true;
        record.e2ee_envelope = Some(wrapped());
        assert!(matches!(
            record.validate(),
            Err(LinkError::InvariantViolation(_))
        ));
    }

    #[test]
    fn both_generations_populated_is_invalid() {
        let mut record = MessageRecord::plaintext(1, false, "a", 0, Direction::Received, "x");
        record.encrypted = true;
        record.nonce = Some(vec![0; 24]);
        record.e2ee_envelope = Some(wrapped());
        let mut map = BTreeMap::new();
        map.insert(DeviceId::new("d1"), wrapped());
        record.key_map = Some(map);
        assert!(record.validate().is_err());
    }

    #[test]
    fn failed_record_requires_placeholder() {
        let mut record = MessageRecord::plaintext(1, false, "a", 0, Direction::Received, "secret");
        record.e2ee_failed = true;
        record.failure_reason = Some(FailureReason::WrapFailed);
        assert!(record.validate().is_err());

        record.body = ENCRYPTED_PLACEHOLDER.to_string();
        assert!(record.validate().is_ok());
    }

    #[test]
    fn record_json_uses_camel_case_and_skips_empty_fields() {
        let mut record = MessageRecord::plaintext(9, true, "+1555", 77, Direction::Received, "b");
        record.encrypted = true;
        record.nonce = Some(vec![0; 24]);
        record.e2ee_envelope = Some(wrapped());
        record.key_version = Some(EnvelopeVersion::V3);

        let json = record.to_value().unwrap();
        assert_eq!(json["id"], "mms_9");
        assert_eq!(json["isMms"], true);
        assert_eq!(json["direction"], "received");
        assert_eq!(json["keyVersion"], 3);
        assert!(json.get("keyMap").is_none());
        assert!(json.get("attachments").is_none());

        let restored = MessageRecord::from_value(json).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn failure_reason_strings() {
        let json = serde_json::to_value(FailureReason::EncryptionUnavailable).unwrap();
        assert_eq!(json, "encryption_unavailable");
        assert_eq!(FailureReason::WrapFailed.as_str(), "wrap_failed");
    }

    #[test]
    fn outgoing_message_defaults() {
        let msg: OutgoingMessage =
            serde_json::from_str(r#"{"address":"+15551234567","body":"hello"}"#).unwrap();
        assert!(!msg.encrypted);
        assert!(msg.nonce.is_none());
        assert_eq!(msg.timestamp, 0);
    }

    #[test]
    fn attachment_payload_detection() {
        let mut att = Attachment::metadata("p1", "image/jpeg", None, 10);
        assert!(!att.has_payload());
        att.inline_data = Some(vec![1, 2, 3]);
        assert!(att.has_payload());
    }
}
