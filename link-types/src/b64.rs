//! Base64 helpers for byte fields stored in JSON documents.
//!
//! Used with `#[serde(with = "...")]` so ciphertexts, nonces and keys are
//! stored as standard padded base64 strings.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Deserializer, Serializer};

/// Encode bytes as standard base64.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a standard base64 string.
pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

/// Serialize a byte field as base64.
pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsRef<[u8]>,
{
    serializer.serialize_str(&encode(bytes.as_ref()))
}

/// Deserialize a base64 string into bytes.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    decode(&text).map_err(serde::de::Error::custom)
}

/// Same as the parent module, for `Option<Vec<u8>>` fields.
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize an optional byte field as base64 (or null).
    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&super::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional base64 string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => super::decode(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
        #[serde(default, with = "crate::b64::option", skip_serializing_if = "Option::is_none")]
        extra: Option<Vec<u8>>,
    }

    #[test]
    fn bytes_are_stored_as_base64_strings() {
        let holder = Holder {
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
            extra: None,
        };
        let json = serde_json::to_string(&holder).unwrap();
        assert_eq!(json, r#"{"data":"3q2+7w=="}"#);
    }

    #[test]
    fn missing_optional_field_defaults_to_none() {
        let holder: Holder = serde_json::from_str(r#"{"data":"AQID"}"#).unwrap();
        assert_eq!(holder.data, vec![1, 2, 3]);
        assert!(holder.extra.is_none());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let result: Result<Holder, _> = serde_json::from_str(r#"{"data":"not base64!"}"#);
        assert!(result.is_err());
    }
}
