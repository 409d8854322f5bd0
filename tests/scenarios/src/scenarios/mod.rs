//! Scenario groups.
//!
//! - `pairing` - QR approval, key push, key requests, device limits
//! - `sync` - synced history readable on paired devices only
//! - `calls` - one notification per call, remote answer/end
//! - `outgoing` - device-composed messages sent from the phone

pub mod calls;
pub mod outgoing;
pub mod pairing;
pub mod sync;
