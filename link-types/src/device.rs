//! Paired device documents.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{DeviceId, LinkError, PublicKey};

/// Platform of a paired client.
///
/// There is no `Android` variant: the phone is the host and never appears
/// in its own device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// iPhone / iPad client.
    Ios,
    /// macOS desktop client.
    Macos,
    /// Windows desktop client.
    Windows,
    /// Browser client.
    Web,
}

impl Platform {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Macos => "macos",
            Platform::Windows => "windows",
            Platform::Web => "web",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "macos" => Ok(Platform::Macos),
            "windows" => Ok(Platform::Windows),
            "web" => Ok(Platform::Web),
            "android" => Err(LinkError::HostPlatform),
            other => Err(LinkError::InvalidData(format!("unknown platform: {}", other))),
        }
    }
}

/// A device paired with the phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Backend-assigned id.
    pub id: DeviceId,
    /// Name shown in the device list.
    pub display_name: String,
    /// Client platform.
    pub platform: Platform,
    /// Device X25519 public key (absent for very old clients).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    /// Last activity (Unix ms).
    #[serde(default)]
    pub last_seen: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parses_known_values() {
        assert_eq!("ios".parse::<Platform>().unwrap(), Platform::Ios);
        assert_eq!("MacOS".parse::<Platform>().unwrap(), Platform::Macos);
        assert_eq!(" web ".parse::<Platform>().unwrap(), Platform::Web);
    }

    #[test]
    fn android_is_rejected_as_host() {
        assert!(matches!(
            "android".parse::<Platform>(),
            Err(LinkError::HostPlatform)
        ));
    }

    #[test]
    fn android_device_document_fails_to_decode() {
        let json = r#"{"id":"d","displayName":"Pixel","platform":"android"}"#;
        assert!(serde_json::from_str::<Device>(json).is_err());
    }

    #[test]
    fn device_document_roundtrip() {
        let device = Device {
            id: DeviceId::new("dev-7"),
            display_name: "Work laptop".into(),
            platform: Platform::Windows,
            public_key: Some(PublicKey::from_bytes([9; 32])),
            last_seen: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["platform"], "windows");
        assert_eq!(json["displayName"], "Work laptop");
        let restored: Device = serde_json::from_value(json).unwrap();
        assert_eq!(device, restored);
    }
}
