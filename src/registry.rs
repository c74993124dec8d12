// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The composition root: owns every device engine and every profile, and is
//! the only thing that touches either by anything other than message
//! passing.
//!
//! Generalized from the teacher's `manager::DeviceManager` (one protocol,
//! flat device map) into a per-device-engine-task registry whose engines
//! reach their MQTT connections through the profile that owns them.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::Envelope;
use crate::engine::{ConfiguredProtocol, DeviceEngine, EngineMessage};
use crate::error::EngineError;
use crate::event::{DeviceId, EventBus};
use crate::profile::{Profile, ProfileId};

/// How a device is configured when it's added to the registry.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// The device's wire identity.
    pub device_id: DeviceId,
    /// The device's signing key.
    pub key: String,
    /// Which profile owns this device's MQTT connection, if any.
    pub profile_id: Option<ProfileId>,
    /// Which transport to prefer.
    pub protocol: ConfiguredProtocol,
}

/// The registry's handle to a running device engine. The registry never
/// reaches into engine internals directly; every interaction with a running
/// engine is either a message sent through `sender` or a shutdown via `task`.
pub struct EngineHandle {
    engine: std::sync::Arc<DeviceEngine>,
    sender: mpsc::Sender<EngineMessage>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// The engine this handle manages.
    #[must_use]
    pub fn engine(&self) -> &std::sync::Arc<DeviceEngine> {
        &self.engine
    }

    /// A sender for delivering messages to this engine's inbox.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<EngineMessage> {
        self.sender.clone()
    }
}

/// Owns every device engine task and every profile. The crate's single
/// piece of global, mutable state — per the concurrency model, held behind
/// `parking_lot` locks taken only for the duration of a synchronous lookup
/// or insert, never across an await point.
#[derive(Default)]
pub struct Runtime {
    devices: RwLock<HashMap<DeviceId, EngineHandle>>,
    profiles: RwLock<HashMap<ProfileId, Profile>>,
    events: EventBus,
}

impl Runtime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The event bus host applications subscribe to for lifecycle and
    /// advisory notifications.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Registers a profile.
    pub fn add_profile(&self, profile: Profile) {
        self.profiles.write().insert(profile.user_id().clone(), profile);
    }

    /// Looks up a profile by id.
    pub fn profile(&self, id: &ProfileId) -> Option<()> {
        self.profiles.read().get(id).map(|_| ())
    }

    /// Spawns a new device engine task and registers its handle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ProfileNotFound`] if `config.profile_id` names
    /// a profile that hasn't been registered.
    pub fn add_device(&self, config: DeviceConfig) -> Result<DeviceId, EngineError> {
        if let Some(profile_id) = &config.profile_id
            && !self.profiles.read().contains_key(profile_id)
        {
            return Err(EngineError::ProfileNotFound);
        }

        let (engine, inbox) = DeviceEngine::new(
            config.device_id.clone(),
            config.key,
            config.protocol,
            self.events.clone(),
        );
        let sender = engine.inbox();
        let task = tokio::spawn(std::sync::Arc::clone(&engine).run(inbox));

        let device_id = config.device_id;
        self.devices.write().insert(
            device_id.clone(),
            EngineHandle { engine, sender, task },
        );
        self.events.publish(crate::event::EngineEvent::DeviceAdded {
            device_id: device_id.clone(),
        });
        Ok(device_id)
    }

    /// Shuts an engine down: signals it, waits for the task to finish
    /// draining, then drops its handle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DeviceNotFound`] if no engine is registered
    /// for `id`.
    pub async fn remove_device(&self, id: &DeviceId) -> Result<(), EngineError> {
        let handle = self.devices.write().remove(id).ok_or(EngineError::DeviceNotFound)?;
        let _ = handle.sender.send(EngineMessage::Shutdown).await;
        let _ = handle.task.await;
        self.events.publish(crate::event::EngineEvent::DeviceRemoved {
            device_id: id.clone(),
        });
        Ok(())
    }

    /// A sender for delivering messages to a registered device's inbox.
    #[must_use]
    pub fn device_sender(&self, id: &DeviceId) -> Option<mpsc::Sender<EngineMessage>> {
        self.devices.read().get(id).map(EngineHandle::sender)
    }

    /// The number of currently registered devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Routes a raw MQTT publish body addressed to a device under `profile_id`
    /// to that device's inbox, if both the profile and the device are known.
    /// Used when the host bridges MQTT delivery itself rather than letting
    /// this crate's own `MqttConnection` receive it directly.
    pub async fn route_mqtt(&self, body: &str) {
        let Ok(envelope) = serde_json::from_str::<Envelope>(body) else {
            tracing::debug!("dropping unparseable MQTT publish routed through the registry");
            return;
        };
        let Some(device_id) = envelope.device_id().map(DeviceId::new) else {
            tracing::debug!("dropping envelope with no device id in `from`");
            return;
        };
        let Some(sender) = self.device_sender(&device_id) else {
            tracing::debug!(device = %device_id, "no engine registered for inbound envelope");
            return;
        };
        let _ = sender.send(EngineMessage::MqttEnvelope(envelope)).await;
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("device_count", &self.device_count())
            .finish_non_exhaustive()
    }
}
