//! Error types for phonelink documents, and the error taxonomy shared by
//! every layer.

use thiserror::Error;

/// How an error should be treated by the caller.
///
/// Every error enum in the workspace maps onto one of these through a
/// `kind()` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network unavailable, rate-limited, timed out. Retry or skip silently.
    Transient,
    /// Missing key material, malformed envelope, version mismatch.
    /// Recorded on the affected record, otherwise non-fatal.
    Protocol,
    /// Device limit exceeded, unauthenticated. Surfaced to the user.
    Policy,
    /// Duplicate active call, stale command. Resolved by reconciliation.
    Invariant,
}

/// Errors that can occur when encoding, decoding or validating documents.
#[derive(Debug, Error)]
pub enum LinkError {
    /// JSON (de)serialization of a document failed
    #[error("document serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// MessagePack encoding of a key bundle failed
    #[error("key bundle encoding failed: {0}")]
    BundleEncode(#[source] rmp_serde::encode::Error),

    /// MessagePack decoding of a key bundle failed
    #[error("key bundle decoding failed: {0}")]
    BundleDecode(#[source] rmp_serde::decode::Error),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Unknown envelope or payload version
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// The host phone tried to register itself as a paired device
    #[error("android is the host platform and cannot be paired")]
    HostPlatform,

    /// A record breaks one of its structural invariants
    #[error("record invariant violated: {0}")]
    InvariantViolation(String),
}

impl LinkError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::HostPlatform => ErrorKind::Policy,
            _ => ErrorKind::Protocol,
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Serialization(err)
    }
}
