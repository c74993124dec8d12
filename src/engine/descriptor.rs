// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device descriptor: cached `SYSTEM_ALL`/`SYSTEM_ABILITY` payloads plus
//! the typed fields the engine inspects on every reconciliation pass.

use serde_json::Value;

/// Cached device-reported state, refreshed on config reload or ability change.
#[derive(Debug, Clone, Default)]
pub struct Descriptor {
    system_all: Option<Value>,
    system_ability: Option<Value>,
    firmware_server: Option<String>,
    firmware_port: Option<u16>,
    mac: Option<String>,
    timezone: Option<String>,
    time_rule: Vec<TimeRule>,
}

/// One entry of the device's `timeRule` DST table: an epoch boundary, the
/// UTC offset (in minutes) that applies from that boundary onward, and
/// whether that offset is the DST-adjusted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRule {
    /// Epoch seconds at which this rule starts applying.
    pub start: i64,
    /// UTC offset in minutes effective from `start`.
    pub offset_minutes: i32,
    /// Whether `offset_minutes` is the daylight-saving-adjusted offset.
    pub is_dst: bool,
}

impl Descriptor {
    /// Replaces the cached `SYSTEM_ALL` payload and re-derives the typed
    /// fields the engine inspects (firmware endpoint, MAC, timezone, time rules).
    pub fn update_system_all(&mut self, payload: Value) {
        self.firmware_server = payload
            .pointer("/all/system/firmware/server")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.firmware_port = payload
            .pointer("/all/system/firmware/port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok());
        self.mac = payload
            .pointer("/all/system/hardware/macAddress")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.timezone = payload
            .pointer("/all/system/time/timezone")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.time_rule = payload
            .pointer("/all/system/time/timeRule")
            .and_then(Value::as_array)
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(|r| {
                        let start = r.get(0)?.as_i64()?;
                        let offset_minutes = i32::try_from(r.get(1)?.as_i64()?).ok()?;
                        let is_dst = r.get(2).and_then(Value::as_i64).unwrap_or(0) != 0;
                        Some(TimeRule {
                            start,
                            offset_minutes,
                            is_dst,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.system_all = Some(payload);
    }

    /// Replaces the cached `SYSTEM_ABILITY` payload. Returns `true` if the
    /// set of ability namespace keys differs from what was cached before —
    /// that, and not a byte-for-byte payload diff, is what warrants a
    /// config reload (per-namespace parameters changing without the
    /// namespace set itself changing doesn't need one).
    pub fn update_system_ability(&mut self, payload: Value) -> bool {
        let before = self.ability_names();
        self.system_ability = Some(payload);
        let after = self.ability_names();
        before != after
    }

    fn ability_names(&self) -> std::collections::BTreeSet<String> {
        self.system_ability
            .as_ref()
            .and_then(|v| v.pointer("/ability"))
            .and_then(Value::as_object)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if a namespace is present in the last-known abilities.
    #[must_use]
    pub fn has_ability(&self, namespace: &str) -> bool {
        self.system_ability
            .as_ref()
            .and_then(|v| v.pointer("/ability"))
            .and_then(Value::as_object)
            .is_some_and(|map| map.contains_key(namespace))
    }

    /// The device's advertised `Appliance.Control.Multiple` slot count
    /// (`maxCmdNum`), if the device reports the ability at all.
    #[must_use]
    pub fn max_cmd_num(&self) -> Option<usize> {
        self.system_ability
            .as_ref()
            .and_then(|v| v.pointer("/ability/Appliance.Control.Multiple/maxCmdNum"))
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }

    /// The device's advertised local-time host/port for MQTT failover, if known.
    #[must_use]
    pub fn firmware_endpoint(&self) -> Option<(&str, u16)> {
        match (&self.firmware_server, self.firmware_port) {
            (Some(server), Some(port)) => Some((server.as_str(), port)),
            _ => None,
        }
    }

    /// The device's MAC address, if known.
    #[must_use]
    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    /// The IANA timezone name the device reports, if any.
    #[must_use]
    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    /// The device's DST rule table, sorted ascending by `start`.
    #[must_use]
    pub fn time_rule(&self) -> &[TimeRule] {
        &self.time_rule
    }

    /// Returns `true` once at least one `SYSTEM_ALL` payload has been cached.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.system_all.is_some()
    }
}
