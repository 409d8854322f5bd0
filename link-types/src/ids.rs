//! Identity types for phonelink.
//!
//! All ids are strings because they are path segments in the cloud store.
//! Device and user ids are assigned by the backend; call ids are generated
//! locally; message keys are derived from the local message store.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing id string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// A paired device, as assigned by the backend on pairing approval.
    DeviceId
);

string_id!(
    /// The authenticated user that owns the storage namespace.
    UserId
);

string_id!(
    /// A sync group: every device belonging to one user shares its keypair.
    SyncGroupId
);

string_id!(
    /// A physical phone call. Generated locally when a call starts ringing.
    CallId
);

impl CallId {
    /// Create a fresh random call id (UUID v4).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Stable storage key of a synced message.
///
/// SMS and MMS rows live in different local tables whose ids can collide,
/// so MMS keys carry an `mms_` prefix.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKey(String);

impl MessageKey {
    /// Derive the key from the local store id.
    pub fn new(source_id: i64, is_mms: bool) -> Self {
        if is_mms {
            Self(format!("mms_{}", source_id))
        } else {
            Self(source_id.to_string())
        }
    }

    /// Parse a stored key back into `(source_id, is_mms)`.
    pub fn parse(key: &str) -> Option<(i64, bool)> {
        match key.strip_prefix("mms_") {
            Some(rest) => rest.parse().ok().map(|id| (id, true)),
            None => key.parse().ok().map(|id| (id, false)),
        }
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageKey({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sms_key_is_plain_id() {
        assert_eq!(MessageKey::new(42, false).as_str(), "42");
    }

    #[test]
    fn mms_key_is_prefixed() {
        assert_eq!(MessageKey::new(42, true).as_str(), "mms_42");
    }

    #[test]
    fn sms_and_mms_with_same_id_differ() {
        assert_ne!(MessageKey::new(7, false), MessageKey::new(7, true));
    }

    #[test]
    fn message_key_parses_back() {
        assert_eq!(MessageKey::parse("mms_913"), Some((913, true)));
        assert_eq!(MessageKey::parse("913"), Some((913, false)));
        assert_eq!(MessageKey::parse("mms_"), None);
        assert_eq!(MessageKey::parse("abc"), None);
    }

    #[test]
    fn call_id_random_is_unique() {
        assert_ne!(CallId::random(), CallId::random());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = DeviceId::new("dev-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""dev-1""#);
        let key = MessageKey::new(5, true);
        assert_eq!(serde_json::to_string(&key).unwrap(), r#""mms_5""#);
    }

    #[test]
    fn device_id_debug_names_type() {
        let id = DeviceId::new("abc");
        assert_eq!(format!("{:?}", id), "DeviceId(abc)");
    }
}
