// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-visible engine events.
//!
//! Per the error-handling design, most failures are absorbed by the engine
//! (health flags flip, retries reschedule) and never reach this channel.
//! Only conditions a host application needs to act on are published here.

use super::DeviceId;

/// Events published on the runtime-wide event bus.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A device was registered with the runtime.
    DeviceAdded {
        /// The id of the added device.
        device_id: DeviceId,
    },

    /// A device was unregistered from the runtime.
    DeviceRemoved {
        /// The id of the removed device.
        device_id: DeviceId,
    },

    /// Transport health toggled online/offline.
    Online {
        /// The id of the device.
        device_id: DeviceId,
        /// `true` if the device just came online, `false` if it went offline.
        online: bool,
    },

    /// A reply came from a device other than the one addressed.
    IdentityMismatch {
        /// The id of the device.
        device_id: DeviceId,
        /// The id found in the reply's `from` field.
        got: DeviceId,
    },

    /// The configured key was rejected with no recovery available.
    KeyError {
        /// The id of the device.
        device_id: DeviceId,
    },

    /// A timezone/DST advisory was raised or cleared.
    TimezoneAdvisory {
        /// The id of the device.
        device_id: DeviceId,
        /// `true` if the mismatch is newly raised, `false` if it cleared.
        raised: bool,
    },

    /// The device's `SYSTEM_ABILITY` changed, triggering a descriptor reload.
    AbilitiesChanged {
        /// The id of the device.
        device_id: DeviceId,
    },

    /// A device publishing on a shared MQTT connection before any engine
    /// attached it has now handed over both descriptor namespaces, so the
    /// host can add it as a fully-described device.
    DiscoveryComplete {
        /// The id of the discovered device.
        device_id: DeviceId,
    },
}

impl EngineEvent {
    /// Returns the device id this event pertains to.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::DeviceAdded { device_id }
            | Self::DeviceRemoved { device_id }
            | Self::Online { device_id, .. }
            | Self::IdentityMismatch { device_id, .. }
            | Self::KeyError { device_id }
            | Self::TimezoneAdvisory { device_id, .. }
            | Self::AbilitiesChanged { device_id }
            | Self::DiscoveryComplete { device_id } => device_id,
        }
    }

    /// Returns `true` if this is a device lifecycle event (added/removed).
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::DeviceAdded { .. } | Self::DeviceRemoved { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_extraction() {
        let id = DeviceId::new("abc");
        let added = EngineEvent::DeviceAdded {
            device_id: id.clone(),
        };
        assert_eq!(added.device_id(), &id);
        assert!(added.is_lifecycle());
    }

    #[test]
    fn non_lifecycle_events() {
        let id = DeviceId::new("abc");
        let event = EngineEvent::Online {
            device_id: id,
            online: true,
        };
        assert!(!event.is_lifecycle());
    }

    #[test]
    fn discovery_complete_carries_its_device_id() {
        let id = DeviceId::new("abc");
        let event = EngineEvent::DiscoveryComplete {
            device_id: id.clone(),
        };
        assert_eq!(event.device_id(), &id);
        assert!(!event.is_lifecycle());
    }
}
