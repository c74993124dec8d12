// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device identifier type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a device, as it appears on the wire.
///
/// Unlike a locally-generated UUID, this id is handed to us by the device
/// itself (in the `from` field of every envelope, and in the cloud device
/// inventory). It is normalized to lowercase so that wire-derived and
/// inventory-derived ids compare equal regardless of the device's casing.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps a raw device id string, normalizing it to lowercase.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().to_ascii_lowercase())
    }

    /// Returns the id as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for DeviceId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case() {
        assert_eq!(DeviceId::new("ABC123"), DeviceId::new("abc123"));
    }

    #[test]
    fn as_str_round_trips() {
        let id = DeviceId::new("deviceA1");
        assert_eq!(id.as_str(), "devicea1");
    }

    #[test]
    fn debug_and_display() {
        let id = DeviceId::new("xyz");
        assert_eq!(format!("{id}"), "xyz");
        assert_eq!(format!("{id:?}"), "DeviceId(xyz)");
    }

    #[test]
    fn hashable() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(DeviceId::new("one"));
        assert!(set.contains(&DeviceId::new("ONE")));
    }
}
