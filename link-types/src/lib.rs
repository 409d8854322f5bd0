//! # link-types
//!
//! Document types for the phonelink sync engine.
//!
//! Everything in this crate is what actually lands in the cloud store (or
//! travels through it) between the phone and its paired devices:
//! - [`MessageKey`], [`DeviceId`], [`UserId`], [`CallId`], [`SyncGroupId`] - identity types
//! - [`MessageRecord`], [`OutgoingMessage`] - message documents
//! - [`Device`], [`Platform`] - paired device documents
//! - [`CallRecord`], [`CallCommand`] - real-time call state
//! - [`WrappedKey`], [`KeyRequest`], [`KeyResponse`], [`KeyBundle`] - key distribution
//! - [`StoragePaths`] - the per-user storage layout
//! - [`LinkError`], [`ErrorKind`] - error types and taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod b64;
mod call;
mod clock;
mod device;
mod error;
mod ids;
mod keys;
mod message;
mod paths;

pub use call::{CallCommand, CallCommandKind, CallRecord, CallState};
pub use clock::now_millis;
pub use device::{Device, Platform};
pub use error::{ErrorKind, LinkError};
pub use ids::{CallId, DeviceId, MessageKey, SyncGroupId, UserId};
pub use keys::{
    EnvelopeVersion, KeyBundle, KeyRequest, KeyResponse, PublicKey, WrappedKey, PUBLIC_KEY_SIZE,
};
pub use message::{
    Attachment, Direction, FailureReason, MessageRecord, OutgoingMessage, ENCRYPTED_PLACEHOLDER,
};
pub use paths::StoragePaths;
