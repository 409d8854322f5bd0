//! # link-core
//!
//! Pure logic for phonelink (no I/O, instant tests).
//!
//! This crate implements the decisions of the sync engine without any
//! network, disk or crypto I/O:
//! - [`address`] - who a local message is really with, and the RCS filter
//! - [`phone`] - phone number comparison
//! - [`pairing`] - QR payloads, the host-side session registry, backend results
//! - [`calls`] - the call state tracker and its effects
//! - [`batch`] - bulk sync planning and progress
//! - [`cache`] - bounded id sets
//! - [`retry`] - backoff with jitter
//!
//! The actual I/O is performed by `link-client`, which interprets the
//! decisions and effects produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod batch;
pub mod cache;
pub mod calls;
pub mod pairing;
pub mod phone;
pub mod retry;

pub use address::{
    is_rcs_address, resolve, LocalAttachment, LocalMessage, NoThreads, Resolution, SkipReason,
    ThreadLookup,
};
pub use batch::{plan, BatchPlan, Progress, DEFAULT_BATCH_SIZE};
pub use cache::BoundedIdSet;
pub use calls::{
    CallEffect, CallTracker, CallTrackerConfig, CommandDecision, TelephonyAction,
};
pub use pairing::{
    check_device_limit, PairingOutcome, PairingQrPayload, PairingSession, SessionError,
    SessionRegistry, SessionStatus, UsageCheck, DEFAULT_PAIRING_WINDOW,
};
pub use retry::RetryPolicy;
