//! Device pairing: QR payloads and the host-side session registry.
//!
//! The pairing flow:
//! 1. The new device shows a QR code carrying a [`PairingQrPayload`]
//! 2. The phone scans it and registers the token in a [`SessionRegistry`]
//! 3. The user approves or rejects; the phone asks the backend to complete
//!    pairing and gets a [`PairingOutcome`] back
//! 4. On approval the phone pushes its key material to the new device
//!
//! A session is one-shot: `pending -> approved` or `pending -> rejected`.
//! Tokens seen for longer than the pairing window are expired and refused
//! locally, without asking the backend.

use link_types::{DeviceId, ErrorKind, LinkError, Platform, PublicKey, SyncGroupId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Default pairing window (5 minutes).
pub const DEFAULT_PAIRING_WINDOW: Duration = Duration::from_secs(300);

/// Highest QR payload version this host understands.
pub const QR_PAYLOAD_VERSION: u32 = 2;

/// Error type for pairing session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The QR payload is not valid JSON or misses fields.
    InvalidPayload(String),
    /// The QR payload was produced by an unsupported client version.
    UnsupportedVersion(u32),
    /// The QR payload claims to come from an android device.
    HostPlatform,
    /// The token was first seen longer ago than the pairing window.
    Expired,
    /// The session was already approved or rejected.
    AlreadyResolved(SessionStatus),
    /// The token was never registered.
    UnknownSession,
}

impl SessionError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidPayload(_) | SessionError::UnsupportedVersion(_) => {
                ErrorKind::Protocol
            }
            SessionError::HostPlatform => ErrorKind::Policy,
            SessionError::Expired
            | SessionError::AlreadyResolved(_)
            | SessionError::UnknownSession => ErrorKind::Invariant,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidPayload(msg) => write!(f, "invalid pairing payload: {}", msg),
            SessionError::UnsupportedVersion(v) => {
                write!(f, "unsupported pairing payload version: {}", v)
            }
            SessionError::HostPlatform => write!(f, "android devices cannot be paired"),
            SessionError::Expired => write!(f, "pairing session has expired"),
            SessionError::AlreadyResolved(status) => {
                write!(f, "pairing session already {}", status.as_str())
            }
            SessionError::UnknownSession => write!(f, "unknown pairing session"),
        }
    }
}

impl std::error::Error for SessionError {}

// ============================================================================
// QR payload
// ============================================================================

/// What a new device encodes in its pairing QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingQrPayload {
    /// One-time pairing token issued by the backend.
    pub token: String,
    /// Display name of the new device.
    pub name: String,
    /// Platform of the new device.
    pub platform: Platform,
    /// Payload format version.
    pub version: u32,
    /// X25519 public key the host must seal keys for.
    pub public_key: PublicKey,
    /// Sync group the device already belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_group_id: Option<SyncGroupId>,
}

/// Wire shape before validation; platform is kept as text so android can
/// be reported distinctly.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    token: String,
    name: String,
    platform: String,
    version: u32,
    public_key: String,
    #[serde(default)]
    sync_group_id: Option<SyncGroupId>,
}

impl PairingQrPayload {
    /// Encode as the JSON text shown in the QR code.
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::InvalidPayload(format!("json encode: {}", e)))
    }

    /// Decode and validate the JSON text from a scanned QR code.
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let raw: RawPayload = serde_json::from_str(text.trim())
            .map_err(|e| SessionError::InvalidPayload(format!("json parse: {}", e)))?;

        if raw.version == 0 || raw.version > QR_PAYLOAD_VERSION {
            return Err(SessionError::UnsupportedVersion(raw.version));
        }
        if raw.token.trim().is_empty() {
            return Err(SessionError::InvalidPayload("empty token".into()));
        }

        let platform = raw.platform.parse::<Platform>().map_err(|e| match e {
            LinkError::HostPlatform => SessionError::HostPlatform,
            other => SessionError::InvalidPayload(other.to_string()),
        })?;
        let public_key = raw
            .public_key
            .parse::<PublicKey>()
            .map_err(|e| SessionError::InvalidPayload(e.to_string()))?;

        Ok(Self {
            token: raw.token,
            name: raw.name,
            platform,
            version: raw.version,
            public_key,
            sync_group_id: raw.sync_group_id,
        })
    }
}

// ============================================================================
// Session registry
// ============================================================================

/// Status of a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Waiting for the user's decision.
    Pending,
    /// Approved; terminal.
    Approved,
    /// Rejected; terminal.
    Rejected,
    /// Outside the pairing window; terminal.
    Expired,
}

impl SessionStatus {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Approved => "approved",
            SessionStatus::Rejected => "rejected",
            SessionStatus::Expired => "expired",
        }
    }
}

/// A pairing session as tracked by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSession {
    /// Pairing token.
    pub token: String,
    /// Public key the new device asked us to seal for.
    pub requested_public_key: PublicKey,
    /// Current status.
    pub status: SessionStatus,
    /// When the host first saw the token (Unix ms).
    pub first_seen_at: u64,
}

/// Host-side registry of pairing tokens.
#[derive(Debug)]
pub struct SessionRegistry {
    window: Duration,
    sessions: HashMap<String, PairingSession>,
}

impl SessionRegistry {
    /// Create a registry with the given pairing window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sessions: HashMap::new(),
        }
    }

    /// Register a scanned payload, or re-check one seen before.
    ///
    /// Returns the session if it is still pending and inside the window.
    pub fn observe(
        &mut self,
        payload: &PairingQrPayload,
        now_ms: u64,
    ) -> Result<&PairingSession, SessionError> {
        let session = self
            .sessions
            .entry(payload.token.clone())
            .or_insert_with(|| PairingSession {
                token: payload.token.clone(),
                requested_public_key: payload.public_key,
                status: SessionStatus::Pending,
                first_seen_at: now_ms,
            });
        Self::check_live(session, self.window, now_ms)?;
        Ok(session)
    }

    /// Verify a registered session may still be resolved.
    pub fn ensure_pending(&mut self, token: &str, now_ms: u64) -> Result<(), SessionError> {
        let window = self.window;
        let session = self
            .sessions
            .get_mut(token)
            .ok_or(SessionError::UnknownSession)?;
        Self::check_live(session, window, now_ms)
    }

    /// One-shot transition out of `pending`.
    pub fn resolve(&mut self, token: &str, approved: bool) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(token)
            .ok_or(SessionError::UnknownSession)?;
        if session.status != SessionStatus::Pending {
            return Err(SessionError::AlreadyResolved(session.status));
        }
        session.status = if approved {
            SessionStatus::Approved
        } else {
            SessionStatus::Rejected
        };
        Ok(())
    }

    /// Look up a session.
    pub fn get(&self, token: &str) -> Option<&PairingSession> {
        self.sessions.get(token)
    }

    /// Forget sessions first seen more than four windows ago.
    ///
    /// Returns the number of sessions dropped.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let horizon = self.window.as_millis() as u64 * 4;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now_ms.saturating_sub(s.first_seen_at) <= horizon);
        before - self.sessions.len()
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn check_live(
        session: &mut PairingSession,
        window: Duration,
        now_ms: u64,
    ) -> Result<(), SessionError> {
        if session.status == SessionStatus::Pending
            && now_ms.saturating_sub(session.first_seen_at) > window.as_millis() as u64
        {
            session.status = SessionStatus::Expired;
        }
        match session.status {
            SessionStatus::Pending => Ok(()),
            SessionStatus::Expired => Err(SessionError::Expired),
            other => Err(SessionError::AlreadyResolved(other)),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PAIRING_WINDOW)
    }
}

// ============================================================================
// Backend results
// ============================================================================

/// Result of the backend's `completePairing` procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PairingOutcome {
    /// The device was registered.
    Approved {
        /// Id assigned to the new device.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        /// Owner of the namespace the device joined.
        #[serde(rename = "userId")]
        user_id: UserId,
        /// The device had been paired before.
        #[serde(rename = "isRePairing", default)]
        is_re_pairing: bool,
    },
    /// The backend refused the pairing.
    Rejected,
    /// The backend reported an error.
    Error {
        /// Machine-readable reason (`device_limit`, `expired`, ...).
        reason: String,
        /// Devices currently paired (device-limit errors).
        #[serde(
            rename = "currentDevices",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        current_devices: Option<u32>,
        /// Plan limit (device-limit errors).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
}

/// Reason string the backend uses for device-limit errors.
pub const DEVICE_LIMIT_REASON: &str = "device_limit";

impl PairingOutcome {
    /// Decode a procedure result.
    pub fn from_value(value: Value) -> Result<Self, SessionError> {
        serde_json::from_value(value)
            .map_err(|e| SessionError::InvalidPayload(format!("pairing result: {}", e)))
    }

    /// `(current, limit)` when this is a device-limit error.
    pub fn device_limit(&self) -> Option<(u32, u32)> {
        match self {
            PairingOutcome::Error {
                reason,
                current_devices,
                limit,
            } if reason == DEVICE_LIMIT_REASON => {
                let limit = limit.unwrap_or(0);
                Some((current_devices.unwrap_or(limit), limit))
            }
            _ => None,
        }
    }
}

/// Result of a plan-usage check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageCheck {
    /// Another device can be paired.
    WithinLimit {
        /// Devices currently paired.
        current: u32,
        /// Plan limit.
        limit: u32,
    },
    /// Pairing another device will be refused.
    AtLimit {
        /// Devices currently paired.
        current: u32,
        /// Plan limit.
        limit: u32,
    },
}

/// Compare a device count against the plan limit.
pub fn check_device_limit(current: u32, limit: u32) -> UsageCheck {
    if current >= limit {
        UsageCheck::AtLimit { current, limit }
    } else {
        UsageCheck::WithinLimit { current, limit }
    }
}
