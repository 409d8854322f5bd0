//! # link-client
//!
//! The I/O half of phonelink: everything that talks to the cloud store,
//! the key store and the phone's telephony layer.
//!
//! ## Components
//!
//! - [`MessageSyncEngine`]: writes SMS/MMS records, sealing bodies for the
//!   sync group (v3) or per device (v2), uploading attachments once
//! - [`OutgoingListener`]: sends messages queued by paired devices
//! - [`PairingCoordinator`]: approves QR pairings and pushes key bundles
//! - [`CallStateReconciler`]: one incoming-call notification per call,
//!   remote answer/reject/end commands
//!
//! All of them hold an `Arc<dyn SyncTransport>`; [`MockTransport`] stands in
//! for the backend in tests.
//!
//! ## Example
//!
//! ```ignore
//! use link_client::{Config, MessageSyncEngine, SyncCaches, SyncOptions};
//!
//! let config = Config::from_file(path)?;
//! let engine = MessageSyncEngine::new(
//!     transport,
//!     uploader,
//!     keys,
//!     Arc::new(SyncCaches::new()),
//!     SyncOptions::from_config(&config),
//! );
//! let report = engine.sync_many(messages, &lookup, |p| println!("{:?}", p)).await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod calls;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod keystore;
pub mod outgoing;
pub mod pairing;
pub mod shutdown;
pub mod sync;
pub mod transport;

pub use cache::{content_hash, SyncCaches, UploadedBlob};
pub use calls::{CallError, CallStateReconciler, ListenerExit, TelephonyControl};
pub use config::{Config, ConfigError};
pub use crypto::{open_sealed, seal_for, CryptoError, DataKey, KeyPair, KEY_SIZE, NONCE_SIZE};
pub use envelope::{open_document, open_record, seal_record, EnvelopeError, Recipients};
pub use keystore::{
    load_keyring, FileKeyStore, KeyStore, KeyStoreError, Keyring, MemoryKeyStore, SyncGroupKey,
};
pub use outgoing::{Delivery, MessageSender, OutgoingError, OutgoingListener};
pub use pairing::{
    open_key_response, receive_key_bundle, request_key_bundle, Approval, ApprovalResult,
    PairingCoordinator, PairingError,
};
pub use shutdown::Shutdown;
pub use sync::{
    MessageSyncEngine, Protection, SkipCause, SyncError, SyncOptions, SyncOutcome, SyncReport,
};
pub use transport::{
    BlobUploader, ChildEvent, HttpUploader, MockTransport, MockUploader, SyncTransport,
    TransportError,
};
