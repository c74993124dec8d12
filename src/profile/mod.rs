// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cloud account profiles: credentials, the device inventory, and the MQTT
//! connections a device is reached through.
//!
//! Grounded on `meross_profile.py`'s `MerossCloudProfile`. Persistence and
//! the cloud device-list API are external collaborators the host
//! application supplies, matching this crate's framing that storage and
//! network policy outside the device protocol itself are not this crate's
//! concern — see [`ProfileStore`] and [`CloudApi`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::event::{DeviceId, EventBus};
use crate::protocol::{ConnectionKey, ConnectionPool, MqttConnection, MqttConnectionConfig};

/// How long a debounced inventory save waits for further writes before
/// actually persisting.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(30);
/// Default interval between cloud device-list refreshes.
pub const INVENTORY_PERIOD: Duration = Duration::from_secs(4 * 3600);

/// Identifies a profile: a cloud account's `user-id`, or the `local`
/// sentinel for devices reached without a cloud account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    /// The sentinel identifying devices with no cloud account.
    pub const LOCAL: &'static str = "local";

    /// Wraps a cloud user id.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self(user_id.into())
    }

    /// The `local` sentinel profile id.
    #[must_use]
    pub fn local() -> Self {
        Self(Self::LOCAL.to_string())
    }

    /// The underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An opaque cloud API bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudToken(String);

impl CloudToken {
    /// Wraps a raw token string.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The cloud-reported record for one device: its two advertised brokers and
/// whatever else the host wants to carry alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device id (`uuid` in the cloud API).
    pub device_id: DeviceId,
    /// Primary broker domain, `host:port` or bare `host`.
    pub domain: String,
    /// Fallback broker domain, used if it differs from `domain`.
    pub reserved_domain: String,
    /// Subdevices reported under this device when it's a hub, keyed by
    /// `subdeviceId`. Empty for a non-hub device.
    #[serde(default)]
    pub subdevice_info: HashMap<String, SubDeviceInfo>,
    /// Opaque cloud-supplied payload kept alongside the known fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The cloud-reported record for one subdevice paired under a hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubDeviceInfo {
    /// The subdevice id (`subDeviceId` in the cloud API), unique under its hub.
    pub subdevice_id: String,
    /// Opaque cloud-supplied payload kept alongside the known fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The exact shape persisted for one profile between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedProfileStore {
    /// This host's app id, generated once and kept stable.
    pub app_id: String,
    /// The current cloud bearer token, if any.
    pub token: Option<CloudToken>,
    /// The last-known device inventory, keyed by device id.
    pub device_info: HashMap<DeviceId, DeviceInfo>,
    /// Unix timestamp (seconds) of the last successful inventory refresh.
    pub device_info_time: f64,
}

/// Persistence for a profile's [`PersistedProfileStore`]. The host
/// application supplies the implementation (file, database, key-value
/// store); this crate only defines the shape and when to call it.
pub trait ProfileStore: Send + Sync {
    /// Loads the persisted store for `id`, or `None` if nothing is saved yet.
    fn load(&self, id: &ProfileId) -> Option<PersistedProfileStore>;
    /// Persists `data` for `id`.
    fn save(&self, id: &ProfileId, data: &PersistedProfileStore);
}

/// Cloud device-list API, supplied by the host so this crate never embeds a
/// specific vendor endpoint or HTTP client policy.
#[async_trait::async_trait]
pub trait CloudApi: Send + Sync {
    /// Lists devices registered to the account behind `token`.
    async fn device_list(&self, token: &CloudToken) -> Result<Vec<DeviceInfo>, crate::error::CloudTokenError>;
    /// Lists the subdevices paired under the hub `device_id`.
    async fn subdevice_list(
        &self,
        token: &CloudToken,
        device_id: &DeviceId,
    ) -> Result<Vec<SubDeviceInfo>, crate::error::CloudTokenError>;
    /// Invalidates `token` server-side. Best-effort: failures are logged, not propagated.
    async fn logout(&self, token: &CloudToken);
}

/// A cloud account (or the `local` sentinel) and everything it owns: its
/// device inventory and the MQTT connections devices reach it through.
pub struct Profile {
    user_id: ProfileId,
    key: String,
    token: Mutex<Option<CloudToken>>,
    app_id: String,
    device_info: Mutex<HashMap<DeviceId, DeviceInfo>>,
    connections: ConnectionPool,
    allow_mqtt_publish: bool,
    last_query: Mutex<Option<f64>>,
    events: EventBus,
    store: Option<Arc<dyn ProfileStore>>,
    last_save: Mutex<Option<f64>>,
}

impl Profile {
    /// Creates a profile from its persisted store, generating a fresh
    /// `app_id` if none was saved. `store` is kept so a subsequent
    /// [`query_devices`](Self::query_devices) can debounce-save the fresh
    /// inventory back out; pass `None` to never persist (e.g. in tests).
    #[must_use]
    pub fn from_store(
        user_id: ProfileId,
        key: String,
        store_data: PersistedProfileStore,
        allow_mqtt_publish: bool,
        events: EventBus,
        store: Option<Arc<dyn ProfileStore>>,
    ) -> Self {
        let app_id = if store_data.app_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            store_data.app_id
        };
        Self {
            user_id,
            key,
            token: Mutex::new(store_data.token),
            app_id,
            device_info: Mutex::new(store_data.device_info),
            connections: ConnectionPool::new(),
            allow_mqtt_publish,
            last_query: Mutex::new(if store_data.device_info_time > 0.0 {
                Some(store_data.device_info_time)
            } else {
                None
            }),
            events,
            store,
            last_save: Mutex::new(None),
        }
    }

    /// The profile's cloud user id (or `local`).
    #[must_use]
    pub fn user_id(&self) -> &ProfileId {
        &self.user_id
    }

    /// The signing key shared by every device under this profile.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// This host's persisted app id.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Snapshots the current state into its persisted shape.
    pub async fn to_store(&self) -> PersistedProfileStore {
        PersistedProfileStore {
            app_id: self.app_id.clone(),
            token: self.token.lock().await.clone(),
            device_info: self.device_info.lock().await.clone(),
            device_info_time: self.last_query.lock().await.unwrap_or(0.0),
        }
    }

    /// Whether a fresh inventory query is due, given `now` (unix seconds).
    pub async fn needs_query_devices(&self, now: f64) -> bool {
        match *self.last_query.lock().await {
            Some(last) => now - last > INVENTORY_PERIOD.as_secs_f64(),
            None => true,
        }
    }

    /// Refreshes the device inventory from the cloud API, diffing against
    /// the cached list and routing previously-unseen devices into discovery.
    /// For every id in `hub_ids` that's still present in the fresh
    /// inventory, also refreshes its paired subdevice list. Debounce-saves
    /// the refreshed inventory through the store this profile was created
    /// with, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CloudTokenError`](crate::error::CloudTokenError) if no
    /// token is configured or the cloud API call fails.
    pub async fn query_devices(
        &self,
        cloud: &dyn CloudApi,
        known_to_host: &HashSet<DeviceId>,
        hub_ids: &HashSet<DeviceId>,
        now: f64,
    ) -> Result<Vec<DeviceInfo>, crate::error::CloudTokenError> {
        let token = self
            .token
            .lock()
            .await
            .clone()
            .ok_or(crate::error::CloudTokenError::Missing)?;

        let fresh = cloud.device_list(&token).await?;

        let mut cache = self.device_info.lock().await;
        let mut removed: HashSet<DeviceId> = cache.keys().cloned().collect();
        let mut unknown = Vec::new();

        for info in &fresh {
            removed.remove(&info.device_id);
            let mut info = info.clone();
            // A hub's subdevice set is tracked separately from the host's
            // own inventory diff, so carry over whatever was already cached
            // for it before the fresh cloud record (which never carries
            // subdevice info itself) overwrites the entry.
            if let Some(previous) = cache.get(&info.device_id) {
                info.subdevice_info = previous.subdevice_info.clone();
            }
            cache.insert(info.device_id.clone(), info.clone());
            if !known_to_host.contains(&info.device_id) {
                unknown.push(info);
            }
        }
        for id in removed {
            cache.remove(&id);
        }
        drop(cache);

        for hub_id in hub_ids {
            if let Ok(subdevices) = cloud.subdevice_list(&token, hub_id).await {
                self.merge_subdevice_info(hub_id, subdevices).await;
            }
        }

        *self.last_query.lock().await = Some(now);

        if !unknown.is_empty() {
            self.process_unknown_devices(&unknown).await;
        }

        self.maybe_save(now).await;

        Ok(unknown)
    }

    /// Diffs freshly-queried subdevices against what's cached for `hub_id`,
    /// keeping subdevices the cloud no longer reports out of the cache.
    async fn merge_subdevice_info(&self, hub_id: &DeviceId, fresh: Vec<SubDeviceInfo>) {
        let mut cache = self.device_info.lock().await;
        let Some(hub) = cache.get_mut(hub_id) else {
            return;
        };
        let mut removed: HashSet<String> = hub.subdevice_info.keys().cloned().collect();
        for sub in fresh {
            removed.remove(&sub.subdevice_id);
            hub.subdevice_info.insert(sub.subdevice_id.clone(), sub);
        }
        for id in removed {
            hub.subdevice_info.remove(&id);
        }
    }

    /// Persists the current inventory through the configured store, skipping
    /// the write if the last save happened less than [`SAVE_DEBOUNCE`] ago.
    async fn maybe_save(&self, now: f64) {
        let Some(store) = &self.store else {
            return;
        };
        let mut last_save = self.last_save.lock().await;
        if let Some(last) = *last_save {
            if now - last < SAVE_DEBOUNCE.as_secs_f64() {
                return;
            }
        }
        *last_save = Some(now);
        drop(last_save);
        store.save(&self.user_id, &self.to_store().await);
    }

    /// Begins discovery for newly-seen devices, one MQTT connection per
    /// advertised broker (skipping the reserved broker when it's identical).
    async fn process_unknown_devices(&self, unknown: &[DeviceInfo]) {
        if !self.allow_mqtt_publish {
            tracing::warn!(
                profile = %self.user_id.as_str(),
                count = unknown.len(),
                "new devices reported but MQTT publish is disabled: skipping discovery"
            );
            return;
        }

        for info in unknown {
            let brokers: Vec<&str> = if info.domain == info.reserved_domain {
                vec![&info.domain]
            } else {
                vec![&info.domain, &info.reserved_domain]
            };

            for broker in brokers {
                let Some((host, port)) = parse_broker(broker) else {
                    tracing::warn!(broker, "unparseable broker domain, skipping");
                    continue;
                };
                match self.get_or_create_connection(&host, port) {
                    Ok(connection) => {
                        connection.begin_discovery(info.device_id.clone(), tokio::time::Instant::now().into_std());
                    }
                    Err(err) => {
                        tracing::warn!(broker, error = %err, "failed to open MQTT connection for discovery");
                    }
                }
            }
        }
    }

    /// Gets or opens the MQTT connection for `host:port` under this profile.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`](crate::error::TransportError) if a new
    /// connection needs to be opened and fails to construct.
    pub fn get_or_create_connection(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Arc<MqttConnection>, crate::error::TransportError> {
        let key = ConnectionKey::new(self.user_id.as_str(), host, port);
        let config = MqttConnectionConfig::new(host, port);
        self.connections.get_or_connect(key, &config, self.events.clone())
    }

    /// Applies a fresh token: logs out the old one (best-effort), stores the
    /// new one, and returns `true` if an immediate inventory query is due.
    pub async fn refresh_credentials(&self, cloud: &dyn CloudApi, new_token: CloudToken, now: f64) -> bool {
        let mut token = self.token.lock().await;
        if token.as_ref() == Some(&new_token) {
            return false;
        }
        if let Some(old) = token.take() {
            cloud.logout(&old).await;
        }
        *token = Some(new_token);
        drop(token);
        self.needs_query_devices(now).await
    }

    /// Resolves the broker a device should attach to and returns its
    /// connection, preferring `debug_server`/`debug_port` (from a recent
    /// `SYSTEM_DEBUG` payload, authoritative during failover) over the
    /// descriptor's cached firmware server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`](crate::error::TransportError) if the
    /// connection needs to be opened and fails to construct.
    pub fn link(
        &self,
        descriptor_server: Option<(&str, u16)>,
        debug_server: Option<(&str, u16)>,
    ) -> Result<Arc<MqttConnection>, crate::error::TransportError> {
        let (host, port) = debug_server
            .or(descriptor_server)
            .ok_or(crate::error::TransportError::NotConnected)?;
        self.get_or_create_connection(host, port)
    }
}

fn parse_broker(domain: &str) -> Option<(String, u16)> {
    if let Some((host, port)) = domain.rsplit_once(':') {
        port.parse().ok().map(|p| (host.to_string(), p))
    } else if domain.is_empty() {
        None
    } else {
        Some((domain.to_string(), 443))
    }
}
