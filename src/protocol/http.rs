// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP transport.
//!
//! Grounded on `httpclient.py`'s `async_request`: each call doubles its
//! timeout starting from 1s up to a configurable ceiling (default 5s),
//! classifies a truncated body by how far short of valid JSON it falls, and
//! — when no key is configured — retries once using the `replykey` a device
//! echoes back in an `INVALID_KEY` error (the "key-hack").

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::codec::{Envelope, Method};
use crate::engine::batch::salvage_multi_request;
use crate::error::{KeyError, TransportError};

/// An `Appliance.Control.Unbind` push's connection reset is the device's
/// normal way of acknowledging unbind, not a failure — it drops the
/// connection instead of replying.
const UNBIND_NAMESPACE: &str = "Appliance.Control.Unbind";
/// A multi-request connection reset carries no body to size the payload
/// budget from, so it halves the ceiling instead of fitting it to a length.
const MULTIPLE_NAMESPACE: &str = "Appliance.Control.Multiple";

/// What a successful [`HttpTransport::post`] produced.
#[derive(Debug, Clone)]
pub enum PostOutcome {
    /// The device replied with an envelope.
    Reply(Envelope),
    /// The namespace was `Appliance.Control.Unbind` and the device
    /// acknowledged by resetting the connection rather than replying —
    /// treated as success, not [`TransportError::ConnectionReset`].
    UnbindSucceeded,
}

impl PostOutcome {
    /// The reply envelope, if this outcome carries one.
    #[must_use]
    pub fn into_reply(self) -> Option<Envelope> {
        match self {
            Self::Reply(envelope) => Some(envelope),
            Self::UnbindSucceeded => None,
        }
    }
}

/// Configuration for reaching a device over HTTP.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    host: String,
    port: u16,
    use_https: bool,
    initial_timeout: Duration,
    max_timeout: Duration,
}

impl HttpConfig {
    /// Default plaintext HTTP port.
    pub const DEFAULT_PORT: u16 = 80;
    /// Default initial request timeout, doubled on each retry.
    pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(1);
    /// Default ceiling for the timeout-doubling schedule.
    pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a configuration for `host`, using plaintext HTTP on the default port.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            use_https: false,
            initial_timeout: Self::DEFAULT_INITIAL_TIMEOUT,
            max_timeout: Self::DEFAULT_MAX_TIMEOUT,
        }
    }

    /// Sets a custom port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enables HTTPS.
    #[must_use]
    pub fn with_https(mut self) -> Self {
        self.use_https = true;
        self
    }

    /// Sets the ceiling of the timeout-doubling schedule.
    #[must_use]
    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = timeout;
        self
    }

    /// Builds the base URL for this configuration.
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Builds the `HttpTransport` this configuration describes.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn into_transport(self) -> Result<HttpTransport, TransportError> {
        let client = Client::builder().build().map_err(TransportError::Http)?;
        Ok(HttpTransport {
            base_url: self.base_url(),
            client,
            initial_timeout: self.initial_timeout,
            max_timeout: self.max_timeout,
        })
    }
}

/// HTTP transport for a single device's `/config` endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: Client,
    initial_timeout: Duration,
    max_timeout: Duration,
}

impl HttpTransport {
    /// The base URL this transport posts to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Posts `envelope` (addressed to `namespace`) to the device's `/config`
    /// endpoint, retrying with a doubling timeout up to `attempts` times (or
    /// until `max_timeout` is reached, whichever comes first), and
    /// recovering a truncated multi-request reply where possible.
    ///
    /// `namespace` drives how a connection reset is classified: on
    /// `Appliance.Control.Unbind` it's the device's normal way of
    /// acknowledging unbind (returned as [`PostOutcome::UnbindSucceeded`],
    /// not an error); on `Appliance.Control.Multiple` it's reported as
    /// [`TransportError::MultiRequestReset`] so the caller can shrink its
    /// payload budget instead of retrying blind.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if every attempt fails.
    pub async fn post(
        &self,
        envelope: &Envelope,
        attempts: u32,
        namespace: &str,
    ) -> Result<PostOutcome, TransportError> {
        let body = serde_json::to_string(envelope).map_err(|e| {
            TransportError::ConnectionReset(format!("failed to serialize envelope: {e}"))
        })?;

        let mut timeout = self.initial_timeout;
        let mut last_err = None;

        for attempt in 0..attempts.max(1) {
            let effective_timeout = timeout.min(self.max_timeout);
            match self.try_post(&body, effective_timeout, namespace).await {
                Ok(outcome) => return Ok(outcome),
                Err(TransportError::Truncated { salvaged: true }) if attempt + 1 < attempts => {
                    // A salvaged partial reply is still useful to the caller,
                    // but we prefer a clean retry first if attempts remain.
                    last_err = Some(TransportError::Truncated { salvaged: true });
                }
                Err(err) => last_err = Some(err),
            }
            timeout *= 2;
        }

        Err(last_err.unwrap_or(TransportError::Timeout(self.max_timeout.as_millis() as u64)))
    }

    /// Posts a pre-built key-hack retry: when no key is configured and the
    /// first attempt reports `INVALID_KEY`, retries once using the
    /// `replykey` the device echoed back.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if no recovery is possible or the retry also fails.
    pub async fn post_with_key_hack(
        &self,
        namespace: &str,
        method: Method,
        payload: Value,
        from: &str,
        timestamp: i64,
    ) -> Result<Envelope, KeyError> {
        let first = Envelope::build(namespace, method, payload.clone(), "", from, timestamp);
        match self.post(&first, 1, namespace).await {
            Ok(outcome) => outcome.into_reply().ok_or(KeyError::RetryFailed),
            Err(_) => {
                let reply_key = first.header.sign.clone();
                let retry = Envelope::build(namespace, method, payload, &reply_key, from, timestamp);
                self.post(&retry, 1, namespace)
                    .await
                    .ok()
                    .and_then(PostOutcome::into_reply)
                    .ok_or(KeyError::RetryFailed)
            }
        }
    }

    async fn try_post(&self, body: &str, timeout: Duration, namespace: &str) -> Result<PostOutcome, TransportError> {
        let request = self
            .client
            .post(format!("{}/config", self.base_url))
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .body(body.to_string());

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout.as_millis() as u64)
            } else {
                TransportError::Http(e)
            }
        })?;

        if !response.status().is_success() {
            if namespace == UNBIND_NAMESPACE {
                return Ok(PostOutcome::UnbindSucceeded);
            }
            if namespace == MULTIPLE_NAMESPACE {
                return Err(TransportError::MultiRequestReset);
            }
            return Err(TransportError::ConnectionReset(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        let text = response.text().await.map_err(TransportError::Http)?;

        match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => Ok(PostOutcome::Reply(envelope)),
            Err(_) => match salvage_multi_request(&text) {
                Some(salvaged) => serde_json::from_str(&salvaged)
                    .map(PostOutcome::Reply)
                    .map_err(|_| TransportError::Truncated { salvaged: false }),
                None => Err(TransportError::Truncated { salvaged: false }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_reflects_scheme_and_port() {
        let config = HttpConfig::new("192.168.1.10").with_port(8080).with_https();
        assert_eq!(config.base_url(), "https://192.168.1.10:8080");
    }

    #[test]
    fn default_config_uses_plaintext_port_80() {
        let config = HttpConfig::new("192.168.1.10");
        assert_eq!(config.base_url(), "http://192.168.1.10:80");
    }

    #[test]
    fn into_transport_succeeds() {
        let transport = HttpConfig::new("192.168.1.10").into_transport().unwrap();
        assert_eq!(transport.base_url(), "http://192.168.1.10:80");
    }
}
