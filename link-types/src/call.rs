//! Real-time call documents.

use serde::{Deserialize, Serialize};

use crate::CallId;

/// State of a tracked call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Incoming, not yet answered.
    Ringing,
    /// Off-hook.
    Active,
    /// Finished (answered, missed or rejected).
    Ended,
}

/// A call visible to paired devices under `active_calls/{callId}` (and
/// archived under `calls/{callId}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    /// Locally generated call id.
    pub call_id: CallId,
    /// Remote party.
    pub phone_number: String,
    /// Contact display name, if resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    /// Current state.
    pub state: CallState,
    /// Last transition (Unix ms).
    pub timestamp: u64,
}

/// What a paired device asks the phone to do with a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallCommandKind {
    /// Pick up the ringing call.
    Answer,
    /// Decline the ringing call.
    Reject,
    /// Hang up.
    End,
}

/// A command published under `call_commands/{commandId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCommand {
    /// Call the sender believes it is acting on.
    pub call_id: CallId,
    /// Requested action.
    pub command: CallCommandKind,
    /// When the command was issued (Unix ms).
    pub timestamp: u64,
    /// Set by the phone once the command has been handled.
    #[serde(default)]
    pub processed: bool,
}
