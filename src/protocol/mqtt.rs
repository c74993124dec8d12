// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT connection: one shared broker connection serving every device
//! attached to a profile, with discovery for devices that publish before
//! anything has attached them.
//!
//! Grounded on the teacher's `SharedConnection`/`BrokerPool` pair, generalized
//! from "per-device-topic subscription routing" to "per-device-id routing
//! from a single inbound topic", and on `meross_profile.py`'s
//! `mqttdiscovering` dict for the discovery bookkeeping.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec::{Envelope, Method};
use crate::engine::EngineMessage;
use crate::error::TransportError;
use crate::event::{DeviceId, EngineEvent, EventBus};

/// Devices are evicted from discovery after this many unanswered requests.
const DISCOVERY_MAX_REQUESTS: u8 = 5;
/// How long to wait for a discovery reply before re-requesting it.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the background discovery sweep checks for due re-requests.
const DISCOVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// The two descriptor namespaces discovery waits on for a device.
const DISCOVERY_NAMESPACES: [&str; 2] = ["Appliance.System.All", "Appliance.System.Ability"];

/// Configuration for establishing an [`MqttConnection`].
#[derive(Debug, Clone)]
pub struct MqttConnectionConfig {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    keep_alive: Duration,
}

impl MqttConnectionConfig {
    /// Creates a configuration for `host:port` with no credentials.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        }
    }

    /// Sets broker credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// The broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// What's been collected so far for a device discovered mid-flight.
#[derive(Debug, Default, Clone)]
pub struct DiscoveryPayloads {
    /// The device's `SYSTEM_ALL` payload, once received.
    pub system_all: Option<Value>,
    /// The device's `SYSTEM_ABILITY` payload, once received.
    pub system_ability: Option<Value>,
}

impl DiscoveryPayloads {
    fn is_complete(&self) -> bool {
        self.system_all.is_some() && self.system_ability.is_some()
    }

    fn missing_namespaces(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.system_all.is_none() {
            missing.push(DISCOVERY_NAMESPACES[0]);
        }
        if self.system_ability.is_none() {
            missing.push(DISCOVERY_NAMESPACES[1]);
        }
        missing
    }
}

/// Bookkeeping for a device publishing on this connection before any engine
/// has attached it. The typed equivalent of `meross_profile.py`'s
/// `mqttdiscovering` dict.
#[derive(Debug, Clone)]
pub struct DiscoveryState {
    start_time: Instant,
    last_request_time: Instant,
    request_count: u8,
    collected: DiscoveryPayloads,
}

impl DiscoveryState {
    fn new(now: Instant) -> Self {
        Self {
            start_time: now,
            last_request_time: now,
            request_count: 1,
            collected: DiscoveryPayloads::default(),
        }
    }

    /// How long this device has been under discovery.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.start_time)
    }

    /// Whether discovery should be abandoned: too many unanswered requests.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.request_count > DISCOVERY_MAX_REQUESTS
    }

    /// Whether it's time to re-request the missing descriptor namespace.
    #[must_use]
    pub fn is_due_for_retry(&self, now: Instant) -> bool {
        now.duration_since(self.last_request_time) > DISCOVERY_TIMEOUT
    }

    /// The payloads collected for this device so far.
    #[must_use]
    pub fn collected(&self) -> &DiscoveryPayloads {
        &self.collected
    }

    /// The descriptor namespaces still missing from `collected`.
    #[must_use]
    pub fn missing_namespaces(&self) -> Vec<&'static str> {
        self.collected.missing_namespaces()
    }
}

/// One shared broker connection for a profile, serving every attached device.
pub struct MqttConnection {
    client: AsyncClient,
    attached: RwLock<HashMap<DeviceId, mpsc::Sender<EngineMessage>>>,
    discovering: RwLock<HashMap<DeviceId, DiscoveryState>>,
    publish_enabled: std::sync::atomic::AtomicBool,
    events: EventBus,
}

impl std::fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnection").finish_non_exhaustive()
    }
}

impl MqttConnection {
    /// Opens a connection and spawns its background event loop (which fans
    /// out connect/disconnect/envelope notifications to attached engines via
    /// [`EngineMessage`]) plus its discovery sweep loop (which re-requests
    /// the descriptor namespaces still missing for devices under discovery,
    /// and publishes [`EngineEvent::DiscoveryComplete`] on `events` once a
    /// device hands both over).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the client cannot be constructed.
    pub fn connect(
        id_seed: &str,
        config: &MqttConnectionConfig,
        events: EventBus,
    ) -> Result<std::sync::Arc<Self>, TransportError> {
        let client_id = format!("applianceproto_{}_{id_seed}", std::process::id());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, event_loop) = AsyncClient::new(options, 32);
        let connection = std::sync::Arc::new(Self {
            client,
            attached: RwLock::new(HashMap::new()),
            discovering: RwLock::new(HashMap::new()),
            publish_enabled: std::sync::atomic::AtomicBool::new(true),
            events,
        });

        let loop_connection = std::sync::Arc::clone(&connection);
        tokio::spawn(async move {
            run_event_loop(event_loop, loop_connection).await;
        });

        let sweep_connection = std::sync::Arc::clone(&connection);
        tokio::spawn(async move {
            discovery_sweep_loop(sweep_connection).await;
        });

        Ok(connection)
    }

    /// Enables or disables outgoing publishes on this connection (e.g. a
    /// profile configured read-only).
    pub fn set_publish_enabled(&self, enabled: bool) {
        self.publish_enabled
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    /// Attaches a device, registering the channel its messages are forwarded to.
    pub fn attach(&self, device_id: DeviceId, sender: mpsc::Sender<EngineMessage>) {
        self.discovering.write().remove(&device_id);
        self.attached.write().insert(device_id, sender);
    }

    /// Detaches a device; its future publishes fall through to discovery again.
    pub fn detach(&self, device_id: &DeviceId) {
        self.attached.write().remove(device_id);
    }

    /// Starts (or refreshes) discovery bookkeeping for a device no engine
    /// has attached yet.
    pub fn begin_discovery(&self, device_id: DeviceId, now: Instant) {
        self.discovering
            .write()
            .entry(device_id)
            .or_insert_with(|| DiscoveryState::new(now));
    }

    /// `true` if discovery is tracking at least one device.
    #[must_use]
    pub fn has_pending_discovery(&self) -> bool {
        !self.discovering.read().is_empty()
    }

    /// Routes an inbound envelope: attached devices get it forwarded
    /// directly; unattached-but-known devices already under discovery
    /// accumulate the payload; anything else starts discovery.
    pub async fn route(&self, envelope: Envelope, now: Instant) {
        let Some(device_id) = envelope.device_id().map(DeviceId::new) else {
            tracing::debug!("dropping envelope with no device id in `from`");
            return;
        };

        let sender = self.attached.read().get(&device_id).cloned();
        if let Some(sender) = sender {
            if sender.send(EngineMessage::MqttEnvelope(envelope)).await.is_err() {
                tracing::debug!(device = %device_id, "attached engine's inbox is closed");
            }
            return;
        }

        self.accumulate_discovery(device_id, envelope, now);
    }

    fn accumulate_discovery(&self, device_id: DeviceId, envelope: Envelope, now: Instant) {
        let mut discovering = self.discovering.write();
        let state = discovering
            .entry(device_id.clone())
            .or_insert_with(|| DiscoveryState::new(now));
        match envelope.header.namespace.as_str() {
            "Appliance.System.All" => state.collected.system_all = Some(envelope.payload),
            "Appliance.System.Ability" => state.collected.system_ability = Some(envelope.payload),
            other => {
                tracing::trace!(device = %device_id, namespace = %other, "ignoring push during discovery");
            }
        }
        let complete = state.collected.is_complete();
        drop(discovering);
        if complete {
            self.discovering.write().remove(&device_id);
            self.events.publish(EngineEvent::DiscoveryComplete { device_id });
        }
    }

    /// Re-requests whatever descriptor namespaces are still missing for
    /// `device_id`, signing the `GET` with an empty key since the device's
    /// key isn't known until discovery completes.
    async fn request_missing_namespaces(&self, device_id: &DeviceId) {
        let missing = match self.discovering.read().get(device_id) {
            Some(state) => state.missing_namespaces(),
            None => return,
        };
        if missing.is_empty() {
            return;
        }

        let from = format!("/appliance/{}/publish", device_id.as_str());
        let topic = format!("/appliance/{}/subscribe", device_id.as_str());
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        for namespace in missing {
            let envelope = Envelope::build(namespace, Method::Get, serde_json::json!({}), "", &from, timestamp);
            if let Err(err) = self.publish(&topic, Method::Get, &envelope).await {
                tracing::debug!(device = %device_id, namespace, error = %err, "discovery re-request failed");
            }
        }
    }

    /// Sweeps discovery state, evicting stale entries and returning the
    /// device ids that are due for a re-request.
    #[must_use]
    pub fn sweep_discovery(&self, now: Instant) -> Vec<DeviceId> {
        let mut discovering = self.discovering.write();
        discovering.retain(|id, state| {
            let keep = !state.is_stale();
            if !keep {
                tracing::debug!(device = %id, "abandoning discovery after too many retries");
            }
            keep
        });
        discovering
            .iter_mut()
            .filter(|(_, state)| state.is_due_for_retry(now))
            .map(|(id, state)| {
                state.request_count += 1;
                state.last_request_time = now;
                id.clone()
            })
            .collect()
    }

    /// Publishes a request or push for `device_id`, mapping the wire method
    /// to a QoS that approximates priority (`Set` and `Push` at
    /// at-least-once, `Get` at most-once).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishForbidden`] if publishing is
    /// disabled on this connection, or a client error otherwise.
    pub async fn publish(&self, topic: &str, method: Method, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.publish_enabled.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(TransportError::PublishForbidden);
        }
        let qos = match method {
            Method::Get => QoS::AtMostOnce,
            _ => QoS::AtLeastOnce,
        };
        let body = serde_json::to_vec(envelope)
            .map_err(|e| TransportError::ConnectionReset(format!("failed to serialize envelope: {e}")))?;
        self.client
            .publish(topic, qos, false, body)
            .await
            .map_err(TransportError::Mqtt)
    }

    /// Subscribes to the topic this connection should receive inbound
    /// publishes on.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the subscribe request fails.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(TransportError::Mqtt)
    }

    fn notify_all(&self, message: impl Fn() -> EngineMessage) {
        for sender in self.attached.read().values() {
            let _ = sender.try_send(message());
        }
    }
}

async fn run_event_loop(mut event_loop: EventLoop, connection: std::sync::Arc<MqttConnection>) {
    use rumqttc::{Event, Packet};

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connection.notify_all(|| EngineMessage::MqttConnected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Ok(body) = std::str::from_utf8(&publish.payload) else {
                    continue;
                };
                let Ok(envelope) = serde_json::from_str::<Envelope>(body) else {
                    tracing::debug!(topic = %publish.topic, "unparseable MQTT publish");
                    continue;
                };
                connection.route(envelope, Instant::now()).await;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "MQTT event loop error");
                connection.notify_all(|| EngineMessage::MqttDisconnected);
                break;
            }
        }
    }
}

async fn discovery_sweep_loop(connection: std::sync::Arc<MqttConnection>) {
    let mut ticker = tokio::time::interval(DISCOVERY_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let due = connection.sweep_discovery(Instant::now());
        for device_id in due {
            connection.request_missing_namespaces(&device_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(namespace: &str, from: &str) -> Envelope {
        Envelope::build(namespace, Method::Push, serde_json::json!({}), "key", from, 0)
    }

    #[test]
    fn discovery_state_tracks_age_and_retry() {
        let now = Instant::now();
        let state = DiscoveryState::new(now);
        assert!(!state.is_stale());
        assert!(!state.is_due_for_retry(now));
        assert!(state.is_due_for_retry(now + DISCOVERY_TIMEOUT + Duration::from_secs(1)));
    }

    #[test]
    fn discovery_payloads_complete_when_both_present() {
        let mut payloads = DiscoveryPayloads::default();
        assert!(!payloads.is_complete());
        payloads.system_all = Some(serde_json::json!({}));
        assert!(!payloads.is_complete());
        payloads.system_ability = Some(serde_json::json!({}));
        assert!(payloads.is_complete());
    }

    #[tokio::test]
    async fn route_accumulates_discovery_until_complete() {
        let config = MqttConnectionConfig::new("localhost", 1883);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let connection = MqttConnection::connect("test", &config, events).unwrap();

        connection
            .route(
                envelope("Appliance.System.All", "/appliance/abc/publish"),
                Instant::now(),
            )
            .await;
        assert!(connection.has_pending_discovery());
        assert!(rx.try_recv().is_err());

        connection
            .route(
                envelope("Appliance.System.Ability", "/appliance/abc/publish"),
                Instant::now(),
            )
            .await;
        assert!(!connection.has_pending_discovery());
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::DiscoveryComplete { .. })
        ));
    }

    #[test]
    fn missing_namespaces_narrows_as_payloads_arrive() {
        let mut payloads = DiscoveryPayloads::default();
        assert_eq!(payloads.missing_namespaces(), DISCOVERY_NAMESPACES.to_vec());
        payloads.system_all = Some(serde_json::json!({}));
        assert_eq!(payloads.missing_namespaces(), vec!["Appliance.System.Ability"]);
    }

    #[tokio::test]
    async fn request_missing_namespaces_is_a_no_op_without_pending_discovery() {
        let config = MqttConnectionConfig::new("localhost", 1883);
        let connection = MqttConnection::connect("test", &config, EventBus::new()).unwrap();
        // No discovery bookkeeping exists for this id: nothing to request,
        // and nothing should panic trying to look it up.
        connection.request_missing_namespaces(&DeviceId::new("abc")).await;
    }

    #[tokio::test]
    async fn route_forwards_to_attached_engine() {
        let config = MqttConnectionConfig::new("localhost", 1883);
        let connection = MqttConnection::connect("test", &config, EventBus::new()).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        connection.attach(DeviceId::new("abc"), tx);

        connection
            .route(
                envelope("Appliance.System.All", "/appliance/abc/publish"),
                Instant::now(),
            )
            .await;

        assert!(matches!(
            rx.try_recv(),
            Ok(EngineMessage::MqttEnvelope(_))
        ));
        assert!(!connection.has_pending_discovery());
    }

    #[tokio::test]
    async fn sweep_discovery_evicts_stale_entries() {
        let config = MqttConnectionConfig::new("localhost", 1883);
        let connection = MqttConnection::connect("test", &config, EventBus::new()).unwrap();
        let now = Instant::now();
        connection.begin_discovery(DeviceId::new("abc"), now);
        for _ in 0..=DISCOVERY_MAX_REQUESTS {
            connection.sweep_discovery(now + DISCOVERY_TIMEOUT + Duration::from_secs(1));
        }
        assert!(!connection.has_pending_discovery());
    }

    #[tokio::test]
    async fn publish_forbidden_when_disabled() {
        let config = MqttConnectionConfig::new("localhost", 1883);
        let connection = MqttConnection::connect("test", &config, EventBus::new()).unwrap();
        connection.set_publish_enabled(false);
        let envelope = envelope("Appliance.System.All", "/appliance/abc/publish");
        let result = connection.publish("topic", Method::Get, &envelope).await;
        assert!(matches!(result, Err(TransportError::PublishForbidden)));
    }
}
