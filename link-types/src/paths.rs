//! Logical storage layout.
//!
//! Everything lives under a per-user namespace:
//!
//! ```text
//! users/{uid}/messages/{messageKey}
//! users/{uid}/devices/{deviceId}
//! users/{uid}/calls/{callId}            (history)
//! users/{uid}/active_calls/{callId}     (ephemeral)
//! users/{uid}/call_commands/{commandId}
//! users/{uid}/outgoing_messages/{messageId}
//! users/{uid}/e2ee_key_requests/{deviceId}
//! users/{uid}/e2ee_key_responses/{deviceId}
//! users/{uid}/sync_requests/{requestId}
//! ```

use crate::{CallId, DeviceId, MessageKey, UserId};

/// Path builder for one user's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: String,
}

impl StoragePaths {
    /// Paths for the given authenticated user.
    pub fn for_user(user_id: &UserId) -> Self {
        Self {
            root: format!("users/{}", user_id),
        }
    }

    /// Namespace root (`users/{uid}`).
    pub fn root(&self) -> &str {
        &self.root
    }

    fn collection(&self, name: &str) -> String {
        format!("{}/{}", self.root, name)
    }

    fn child(&self, name: &str, key: &str) -> String {
        format!("{}/{}/{}", self.root, name, key)
    }

    /// `messages/`
    pub fn messages(&self) -> String {
        self.collection("messages")
    }

    /// `messages/{messageKey}`
    pub fn message(&self, key: &MessageKey) -> String {
        self.child("messages", key.as_str())
    }

    /// `devices/`
    pub fn devices(&self) -> String {
        self.collection("devices")
    }

    /// `devices/{deviceId}`
    pub fn device(&self, id: &DeviceId) -> String {
        self.child("devices", id.as_str())
    }

    /// `calls/{callId}`
    pub fn call_history(&self, id: &CallId) -> String {
        self.child("calls", id.as_str())
    }

    /// `active_calls/`
    pub fn active_calls(&self) -> String {
        self.collection("active_calls")
    }

    /// `active_calls/{callId}`
    pub fn active_call(&self, id: &CallId) -> String {
        self.child("active_calls", id.as_str())
    }

    /// `call_commands/`
    pub fn call_commands(&self) -> String {
        self.collection("call_commands")
    }

    /// `call_commands/{commandId}`
    pub fn call_command(&self, command_id: &str) -> String {
        self.child("call_commands", command_id)
    }

    /// `outgoing_messages/`
    pub fn outgoing_messages(&self) -> String {
        self.collection("outgoing_messages")
    }

    /// `outgoing_messages/{messageId}`
    pub fn outgoing_message(&self, message_id: &str) -> String {
        self.child("outgoing_messages", message_id)
    }

    /// `e2ee_key_requests/`
    pub fn key_requests(&self) -> String {
        self.collection("e2ee_key_requests")
    }

    /// `e2ee_key_requests/{deviceId}`
    pub fn key_request(&self, id: &DeviceId) -> String {
        self.child("e2ee_key_requests", id.as_str())
    }

    /// `e2ee_key_responses/{deviceId}`
    pub fn key_response(&self, id: &DeviceId) -> String {
        self.child("e2ee_key_responses", id.as_str())
    }

    /// `sync_requests/`
    pub fn sync_requests(&self) -> String {
        self.collection("sync_requests")
    }

    /// `sync_requests/{requestId}`
    pub fn sync_request(&self, request_id: &str) -> String {
        self.child("sync_requests", request_id)
    }

    /// Last segment of a path (the child key).
    pub fn leaf(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }
}
