// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the protocol engine.
//!
//! Transient transport failures never escalate past [`EngineError::Transport`] —
//! the engine swallows them into a health-flag flip and a retry schedule. Only
//! the variants that need a human or a host application to act escalate further.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A transport-level failure. Always transient; the engine retries or
    /// falls through to the other transport rather than surfacing this.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device that answered is not the device that was asked.
    #[error("identity mismatch: expected {expected}, got {got}")]
    IdentityMismatch {
        /// The device id the request was addressed to.
        expected: String,
        /// The device id found in the response's `from` field.
        got: String,
    },

    /// The configured key was rejected and no key-hack recovery was possible.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// A wire payload parsed as JSON but did not have the expected shape.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The device's advertised timezone does not match the host's verification.
    #[error("timezone mismatch for rule set")]
    TimezoneMismatch,

    /// Cloud token refresh or validation failed.
    #[error("cloud token error: {0}")]
    CloudToken(#[from] CloudTokenError),

    /// No engine is registered for the given device id.
    #[error("device not found")]
    DeviceNotFound,

    /// No profile is registered for the given profile id.
    #[error("profile not found")]
    ProfileNotFound,
}

/// Errors from the HTTP or MQTT transport layer. These are always transient
/// from the engine's point of view.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying HTTP request failed.
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The underlying MQTT client failed.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Request timed out after exhausting the relaxation schedule.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// The connection was reset mid-response.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The connection was reset mid-response while flushing a multi-request
    /// batch: no body was received at all, so the payload budget's ceiling
    /// should be halved rather than fitted to a body length.
    #[error("connection reset during multi-request")]
    MultiRequestReset,

    /// The response body was truncated; `salvaged` reports whether a partial
    /// multi-request reply could still be recovered.
    #[error("response truncated (salvaged = {salvaged})")]
    Truncated {
        /// Whether `salvage_multi_request` managed to recover a usable prefix.
        salvaged: bool,
    },

    /// Publish was attempted on a connection with publish disabled.
    #[error("publish forbidden on this connection")]
    PublishForbidden,

    /// The broker or host address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// No connection is currently attached for this device.
    #[error("not connected")]
    NotConnected,
}

/// Errors surfaced when a device rejects the configured key and no recovery
/// (key-hack retry) is available.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The device reported `INVALID_KEY` and no `replykey` was present to retry with.
    #[error("invalid key and no key-hack response available")]
    NoRecovery,

    /// The device reported `INVALID_KEY` even after retrying with the echoed key.
    #[error("invalid key after key-hack retry")]
    RetryFailed,
}

/// Errors from parsing wire payloads.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON parsing failed outright.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON parsed but a required field was absent.
    #[error("missing field in response: {0}")]
    MissingField(String),

    /// JSON parsed but the shape did not match what was expected.
    #[error("unexpected response format: {0}")]
    UnexpectedFormat(String),
}

/// Errors from cloud credential handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudTokenError {
    /// The refresh request was rejected by the cloud endpoint.
    #[error("token refresh rejected: {0}")]
    RefreshRejected(String),

    /// No token is configured for a profile that requires one.
    #[error("no token configured")]
    Missing,
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        let err = TransportError::Timeout(5_000);
        assert_eq!(err.to_string(), "request timed out after 5000 ms");
    }

    #[test]
    fn engine_error_from_transport() {
        let err: EngineError = TransportError::NotConnected.into();
        assert!(matches!(
            err,
            EngineError::Transport(TransportError::NotConnected)
        ));
    }

    #[test]
    fn identity_mismatch_display() {
        let err = EngineError::IdentityMismatch {
            expected: "aa".into(),
            got: "bb".into(),
        };
        assert_eq!(err.to_string(), "identity mismatch: expected aa, got bb");
    }

    #[test]
    fn truncated_display_reports_salvage() {
        let err = TransportError::Truncated { salvaged: true };
        assert_eq!(err.to_string(), "response truncated (salvaged = true)");
    }

    #[test]
    fn key_error_no_recovery_display() {
        let err = KeyError::NoRecovery;
        assert_eq!(
            err.to_string(),
            "invalid key and no key-hack response available"
        );
    }
}
