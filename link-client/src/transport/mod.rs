//! Transport abstraction for phonelink.
//!
//! The engine talks to a cloud relay through [`SyncTransport`]: a document
//! store with overwrite-semantics writes, child listeners and a handful of
//! server-side procedures (pairing, device info). A realtime database or a
//! REST + WebSocket backend can both satisfy it.
//!
//! # Design
//!
//! - Paths are logical (`users/{uid}/messages/{key}`), built with
//!   [`link_types::StoragePaths`]
//! - Documents are JSON values
//! - Listeners are channels of [`ChildEvent`]s; dropping the stream cancels
//!   the listener
//! - Raw blob uploads go through a separate [`BlobUploader`] because they hit
//!   a presigned URL, not the backend API
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::signed_in("user-1");
//! transport.write("users/user-1/messages/1", "1", json!({"body": "hi"})).await?;
//! let doc = transport.read("users/user-1/messages/1").await?;
//! ```

mod http;
mod mock;

pub use http::HttpUploader;
pub use mock::{MockTransport, MockUploader, ProcedureHandler};

use async_trait::async_trait;
use link_types::{ErrorKind, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No network connection.
    #[error("offline")]
    Offline,

    /// No document at the path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend rejected the request.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Machine-readable code (`unauthenticated`, `unavailable`, ...).
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// No authenticated session.
    #[error("not signed in")]
    Unauthenticated,

    /// Request took too long.
    #[error("request timed out")]
    Timeout,

    /// The listener or connection was closed.
    #[error("connection closed")]
    Closed,

    /// Raw blob upload failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// A document could not be encoded or decoded.
    #[error("document encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Create a remote error.
    pub fn remote(code: &str, message: &str) -> Self {
        TransportError::Remote {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Offline
            | TransportError::Timeout
            | TransportError::Closed
            | TransportError::Upload(_) => ErrorKind::Transient,
            TransportError::Unauthenticated => ErrorKind::Policy,
            TransportError::NotFound(_) | TransportError::Serialization(_) => ErrorKind::Protocol,
            TransportError::Remote { code, .. } => match code.as_str() {
                "unavailable" | "deadline-exceeded" | "resource-exhausted" | "aborted" => {
                    ErrorKind::Transient
                }
                "unauthenticated" | "permission-denied" => ErrorKind::Policy,
                _ => ErrorKind::Protocol,
            },
        }
    }

    /// Whether retrying may help.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// A change to one child of a listened-to collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    /// A child appeared (also emitted for children present when listening starts).
    Added {
        /// Child key.
        key: String,
        /// Document.
        value: Value,
    },
    /// A child was overwritten.
    Changed {
        /// Child key.
        key: String,
        /// New document.
        value: Value,
    },
    /// A child was deleted.
    Removed {
        /// Child key.
        key: String,
    },
}

impl ChildEvent {
    /// Key of the affected child.
    pub fn key(&self) -> &str {
        match self {
            ChildEvent::Added { key, .. }
            | ChildEvent::Changed { key, .. }
            | ChildEvent::Removed { key } => key,
        }
    }
}

/// Stream of child events. Dropping it stops the listener.
#[derive(Debug)]
pub struct ChildStream {
    rx: mpsc::Receiver<ChildEvent>,
}

impl ChildStream {
    /// Wrap a channel receiver.
    pub fn new(rx: mpsc::Receiver<ChildEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the transport closed the listener.
    pub async fn next(&mut self) -> Option<ChildEvent> {
        self.rx.recv().await
    }
}

/// One entry of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Document path.
    pub path: String,
    /// Idempotency key (the message key for messages).
    pub idempotency_key: String,
    /// Document.
    pub value: Value,
}

/// Metadata sent when requesting a presigned upload URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    /// File name.
    pub file_name: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Message the file belongs to.
    pub message_key: String,
}

/// Presigned upload slot returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicket {
    /// Where to PUT the bytes.
    pub upload_url: String,
    /// Storage key of the blob.
    pub file_key: String,
    /// Backend file id.
    pub file_id: String,
}

/// Sent after a successful PUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfirmation {
    /// Backend file id.
    pub file_id: String,
    /// Storage key of the blob.
    pub file_key: String,
    /// What was uploaded.
    pub file_meta: FileMeta,
}

/// Transport trait for the cloud relay.
///
/// Implementations handle the underlying mechanism (realtime database,
/// REST + WebSocket, mock).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// The authenticated user id of the current session, if signed in.
    ///
    /// Every per-user path must be built from this id.
    fn session_user_id(&self) -> Option<UserId>;

    /// Whether the network is currently reachable.
    fn is_online(&self) -> bool;

    /// Overwrite the document at `path`.
    async fn write(
        &self,
        path: &str,
        idempotency_key: &str,
        value: Value,
    ) -> Result<(), TransportError>;

    /// Overwrite several documents at once.
    async fn write_batch(&self, entries: Vec<BatchEntry>) -> Result<(), TransportError>;

    /// Read the document at `path`.
    async fn read(&self, path: &str) -> Result<Value, TransportError>;

    /// Delete the document at `path` (no error if absent).
    async fn delete(&self, path: &str) -> Result<(), TransportError>;

    /// Current children of a collection as `(key, document)` pairs.
    async fn list_children(&self, path: &str) -> Result<Vec<(String, Value)>, TransportError>;

    /// Listen to a collection. Existing children arrive as `Added` first.
    async fn listen_children(&self, path: &str) -> Result<ChildStream, TransportError>;

    /// Invoke a server-side procedure.
    async fn call(&self, procedure: &str, args: Value) -> Result<Value, TransportError>;

    /// Request a presigned upload slot.
    async fn get_upload_url(&self, meta: &FileMeta) -> Result<UploadTicket, TransportError>;

    /// Confirm a finished upload.
    async fn confirm_upload(&self, confirmation: &UploadConfirmation)
        -> Result<(), TransportError>;
}

/// Raw HTTP PUT of blob bytes to a presigned URL.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    /// Upload `bytes` to `url`.
    async fn put(&self, url: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<(), TransportError>;
}

/// Read a document, mapping `NotFound` to `None`.
pub async fn read_optional(
    transport: &dyn SyncTransport,
    path: &str,
) -> Result<Option<Value>, TransportError> {
    match transport.read(path).await {
        Ok(v) => Ok(Some(v)),
        Err(TransportError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
