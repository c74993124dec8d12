// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport health flags.
//!
//! These are independent booleans updated from both the HTTP and MQTT call
//! sites without a shared lock — the concurrency model explicitly allows
//! them to race (a flag can be stale by one poll cycle) in exchange for
//! never blocking the send pipeline on a health update.

use std::sync::atomic::{AtomicBool, Ordering};

/// Transport health flags for a single device.
///
/// `online()` is derived, never stored: a device is online whenever either
/// transport is currently reachable.
#[derive(Debug, Default)]
pub struct TransportHealthFlags {
    mqtt_attached: AtomicBool,
    mqtt_connected: AtomicBool,
    mqtt_active: AtomicBool,
    http_active: AtomicBool,
    mqtt_publish_enabled: AtomicBool,
    mqtt_discovering: AtomicBool,
    http_had_response: AtomicBool,
    identity_confirmed: AtomicBool,
}

impl TransportHealthFlags {
    /// Creates all flags in their offline/unconfirmed starting state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if either transport is currently reachable.
    #[must_use]
    pub fn online(&self) -> bool {
        self.mqtt_active.load(Ordering::Relaxed) || self.http_active.load(Ordering::Relaxed)
    }

    /// Returns whether an MQTT connection is currently bound to this device.
    #[must_use]
    pub fn mqtt_attached(&self) -> bool {
        self.mqtt_attached.load(Ordering::Relaxed)
    }

    /// Sets `mqtt_attached`.
    pub fn set_mqtt_attached(&self, value: bool) {
        self.mqtt_attached.store(value, Ordering::Relaxed);
    }

    /// Returns whether the bound MQTT connection's broker socket is up.
    /// Independent of `mqtt_active`: a socket can be connected for a while
    /// before any application-level round trip over it succeeds.
    #[must_use]
    pub fn mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    /// Sets `mqtt_connected`. Clearing it also clears `mqtt_active`, since a
    /// round trip cannot still be "recently successful" over a dead socket.
    pub fn set_mqtt_connected(&self, value: bool) {
        self.mqtt_connected.store(value, Ordering::Relaxed);
        if !value {
            self.mqtt_active.store(false, Ordering::Relaxed);
        }
    }

    /// Returns the current value of `mqtt_active`.
    #[must_use]
    pub fn mqtt_active(&self) -> bool {
        self.mqtt_active.load(Ordering::Relaxed)
    }

    /// Sets `mqtt_active`.
    pub fn set_mqtt_active(&self, value: bool) {
        self.mqtt_active.store(value, Ordering::Relaxed);
    }

    /// Returns the current value of `http_active`.
    #[must_use]
    pub fn http_active(&self) -> bool {
        self.http_active.load(Ordering::Relaxed)
    }

    /// Sets `http_active`.
    pub fn set_http_active(&self, value: bool) {
        self.http_active.store(value, Ordering::Relaxed);
    }

    /// Returns whether this connection is permitted to publish.
    #[must_use]
    pub fn mqtt_publish_enabled(&self) -> bool {
        self.mqtt_publish_enabled.load(Ordering::Relaxed)
    }

    /// Sets whether this connection is permitted to publish.
    pub fn set_mqtt_publish_enabled(&self, value: bool) {
        self.mqtt_publish_enabled.store(value, Ordering::Relaxed);
    }

    /// Returns whether discovery is currently in progress for this device.
    #[must_use]
    pub fn mqtt_discovering(&self) -> bool {
        self.mqtt_discovering.load(Ordering::Relaxed)
    }

    /// Sets whether discovery is currently in progress for this device.
    pub fn set_mqtt_discovering(&self, value: bool) {
        self.mqtt_discovering.store(value, Ordering::Relaxed);
    }

    /// Returns whether HTTP has ever produced a response for this device.
    #[must_use]
    pub fn http_had_response(&self) -> bool {
        self.http_had_response.load(Ordering::Relaxed)
    }

    /// Records that HTTP produced a response.
    pub fn set_http_had_response(&self, value: bool) {
        self.http_had_response.store(value, Ordering::Relaxed);
    }

    /// Returns whether the device's identity has been confirmed at least once.
    #[must_use]
    pub fn identity_confirmed(&self) -> bool {
        self.identity_confirmed.load(Ordering::Relaxed)
    }

    /// Records that the device's identity has been confirmed.
    pub fn set_identity_confirmed(&self, value: bool) {
        self.identity_confirmed.store(value, Ordering::Relaxed);
    }
}
