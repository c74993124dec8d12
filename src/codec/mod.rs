// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire codec: the header+payload envelope shared by HTTP and MQTT transports.
//!
//! Every request and response on the wire is a JSON object with a `header`
//! and a `payload`. The header carries a namespace, a method, a message id
//! used to correlate requests with responses, and an MD5 signature that is
//! advisory rather than authenticated (`verify_sign` never rejects a message,
//! it only flags a mismatch for logging).

use std::fmt;

use serde::{Deserialize, Serialize};

/// The method of a wire message, mirroring the four request verbs plus the
/// two acknowledgement/error responses a device can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Request the current value of a namespace.
    Get,
    /// Request a namespace be set to a new value.
    Set,
    /// An unsolicited notification, usually pushed by the device over MQTT.
    Push,
    /// Successful reply to a `Get`.
    Getack,
    /// Successful reply to a `Set`.
    Setack,
    /// The device rejected the request.
    Error,
}

impl Method {
    const fn as_wire_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Set => "SET",
            Self::Push => "PUSH",
            Self::Getack => "GETACK",
            Self::Setack => "SETACK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

impl Serialize for Method {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "GET" => Ok(Self::Get),
            "SET" => Ok(Self::Set),
            "PUSH" => Ok(Self::Push),
            "GETACK" => Ok(Self::Getack),
            "SETACK" => Ok(Self::Setack),
            "ERROR" => Ok(Self::Error),
            other => Err(serde::de::Error::custom(format!(
                "unknown wire method: {other}"
            ))),
        }
    }
}

/// The header of a wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub namespace: String,
    pub method: Method,
    #[serde(rename = "payloadVersion")]
    pub payload_version: u8,
    pub from: String,
    pub timestamp: i64,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u32,
    pub sign: String,
}

/// A complete wire message: header plus namespace-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Builds a new outgoing envelope, computing `sign` and a fresh message id.
    #[must_use]
    pub fn build(
        namespace: &str,
        method: Method,
        payload: serde_json::Value,
        key: &str,
        from: &str,
        timestamp: i64,
    ) -> Self {
        let message_id = random_message_id();
        let sign = sign(&message_id, key, timestamp);
        Self {
            header: Header {
                message_id,
                namespace: namespace.to_string(),
                method,
                payload_version: 1,
                from: from.to_string(),
                timestamp,
                timestamp_ms: 0,
                sign,
            },
            payload,
        }
    }

    /// Returns the device id embedded in the `from` topic/URI, if present.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        device_id_from_from(&self.header.from)
    }

    /// Recomputes the signature and compares it against the header's `sign`.
    /// A mismatch is advisory only — callers log it, never reject on it.
    #[must_use]
    pub fn verify_sign(&self, key: &str) -> bool {
        sign(&self.header.message_id, key, self.header.timestamp) == self.header.sign
    }
}

/// Computes `md5(message_id ++ key ++ timestamp)`, hex-encoded.
#[must_use]
pub fn sign(message_id: &str, key: &str, timestamp: i64) -> String {
    let input = format!("{message_id}{key}{timestamp}");
    let digest = md5::compute(input.as_bytes());
    hex::encode(digest.0)
}

/// Extracts the device id from a `from` field shaped like
/// `/appliance/<device-id>/publish`.
#[must_use]
pub fn device_id_from_from(from: &str) -> Option<&str> {
    from.split('/').nth(2)
}

fn random_message_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    hex::encode(uuid.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trips_through_wire_strings() {
        for m in [
            Method::Get,
            Method::Set,
            Method::Push,
            Method::Getack,
            Method::Setack,
            Method::Error,
        ] {
            let json = serde_json::to_string(&m).unwrap();
            let back: Method = serde_json::from_str(&json).unwrap();
            assert_eq!(m, back);
        }
    }

    #[test]
    fn unknown_method_is_rejected() {
        let result: Result<Method, _> = serde_json::from_str("\"FROB\"");
        assert!(result.is_err());
    }

    #[test]
    fn sign_is_deterministic() {
        let a = sign("msg-1", "key-1", 1000);
        let b = sign("msg-1", "key-1", 1000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn sign_changes_with_any_input() {
        let base = sign("msg-1", "key-1", 1000);
        assert_ne!(base, sign("msg-2", "key-1", 1000));
        assert_ne!(base, sign("msg-1", "key-2", 1000));
        assert_ne!(base, sign("msg-1", "key-1", 1001));
    }

    #[test]
    fn envelope_build_signs_and_verifies() {
        let env = Envelope::build(
            "Appliance.System.All",
            Method::Get,
            serde_json::json!({}),
            "my-key",
            "/appliance/abc123/publish",
            1_700_000_000,
        );
        assert!(env.verify_sign("my-key"));
        assert!(!env.verify_sign("wrong-key"));
        assert_eq!(env.device_id(), Some("abc123"));
    }

    #[test]
    fn device_id_from_from_handles_short_paths() {
        assert_eq!(device_id_from_from("/appliance/xyz/publish"), Some("xyz"));
        assert_eq!(device_id_from_from("too/short"), None);
        assert_eq!(device_id_from_from(""), None);
    }
}
