//! # phonelink-scenarios
//!
//! Multi-party scenario tests for phonelink.
//!
//! A phone and one or more paired devices share a single in-memory backend
//! ([`harness::FakeBackend`]), so every flow runs end to end through the
//! same documents the real store would hold:
//! - pairing, key push and the legacy key-request path
//! - message sync read back on a paired device
//! - remote call control
//! - messages queued by a paired device and sent by the phone

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod harness;

pub mod scenarios;
