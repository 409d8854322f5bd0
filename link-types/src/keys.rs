//! Key distribution documents.
//!
//! A [`WrappedKey`] is a 32-byte data key sealed for one X25519 public key.
//! A [`KeyBundle`] is the private key material a host hands to a newly
//! paired device; it travels MessagePack-encoded inside a [`KeyResponse`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{DeviceId, LinkError, SyncGroupId};

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Envelope protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum EnvelopeVersion {
    /// One wrapped data key per paired device (`keyMap`).
    V2 = 2,
    /// One wrapped data key for the shared sync-group keypair (`e2eeEnvelope`).
    V3 = 3,
}

impl TryFrom<u8> for EnvelopeVersion {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(EnvelopeVersion::V2),
            3 => Ok(EnvelopeVersion::V3),
            _ => Err(LinkError::UnsupportedVersion(value)),
        }
    }
}

impl From<EnvelopeVersion> for u8 {
    fn from(version: EnvelopeVersion) -> Self {
        version as u8
    }
}

/// An X25519 public key, stored as base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::b64::encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_string()[..8])
    }
}

impl FromStr for PublicKey {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = crate::b64::decode(s.trim())
            .map_err(|e| LinkError::InvalidData(format!("public key base64: {}", e)))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            LinkError::InvalidData(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            ))
        })
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A data key wrapped for one recipient public key.
///
/// `epk` is the sender's ephemeral X25519 public key, `ct` the
/// XChaCha20-Poly1305 ciphertext of the data key under the agreed key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Ephemeral public key of the wrapping operation.
    #[serde(with = "crate::b64")]
    pub epk: Vec<u8>,
    /// Nonce used to seal the data key.
    #[serde(with = "crate::b64")]
    pub nonce: Vec<u8>,
    /// Sealed data key.
    #[serde(with = "crate::b64")]
    pub ct: Vec<u8>,
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedKey")
            .field("epk", &format!("[{} bytes]", self.epk.len()))
            .field("ct", &"[REDACTED]")
            .finish()
    }
}

/// A newly paired device asking the host for key material (legacy pull path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequest {
    /// Device asking for keys.
    pub requester_device_id: DeviceId,
    /// Public key the response must be sealed for.
    pub requester_public_key: PublicKey,
    /// When the request was published (Unix ms).
    #[serde(default)]
    pub timestamp: u64,
}

/// Key material sealed for one device, pushed by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResponse {
    /// Which envelope generation the bundle unlocks.
    pub key_version: EnvelopeVersion,
    /// Sync group the bundle belongs to (v3 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_group_id: Option<SyncGroupId>,
    /// Data key wrapped for the requesting device.
    pub wrapped_key: WrappedKey,
    /// Nonce of the bundle ciphertext.
    #[serde(with = "crate::b64")]
    pub nonce: Vec<u8>,
    /// Sealed MessagePack-encoded [`KeyBundle`].
    #[serde(with = "crate::b64")]
    pub ciphertext: Vec<u8>,
    /// When the host produced the response (Unix ms).
    pub created_at: u64,
}

/// Private key material handed to a paired device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyBundle {
    /// Envelope generation this key decrypts.
    #[zeroize(skip)]
    pub version: EnvelopeVersion,
    /// Sync group id (v3).
    #[zeroize(skip)]
    pub sync_group_id: Option<SyncGroupId>,
    /// X25519 private key bytes.
    pub private_key: Vec<u8>,
    /// Matching public key bytes.
    pub public_key: Vec<u8>,
}

impl KeyBundle {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        rmp_serde::to_vec(self).map_err(LinkError::BundleEncode)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        rmp_serde::from_slice(bytes).map_err(LinkError::BundleDecode)
    }
}

// Intentionally opaque debug to avoid logging secrets
impl fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBundle")
            .field("version", &self.version)
            .field("sync_group_id", &self.sync_group_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}
