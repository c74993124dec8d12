// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection pooling: at most one [`MqttConnection`] per `(profile, host,
//! port)`, shared by every device attached through that profile.
//!
//! Direct generalization of the teacher's `BrokerPool`/`BrokerKey`, keyed by
//! profile identity in addition to broker address since two profiles may
//! legitimately point at the same broker with different credentials.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::TransportError;
use crate::event::EventBus;
use crate::protocol::mqtt::{MqttConnection, MqttConnectionConfig};

/// Identifies a unique pooled connection: a profile's view of a broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    profile_id: String,
    host: String,
    port: u16,
}

impl ConnectionKey {
    /// Creates a key for `profile_id`'s connection to `host:port`.
    #[must_use]
    pub fn new(profile_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            profile_id: profile_id.into(),
            host: host.into(),
            port,
        }
    }
}

/// Pool of MQTT connections, reference-counted and cleaned up automatically
/// once the last attached device detaches and drops its reference.
#[derive(Default)]
pub struct ConnectionPool {
    connections: RwLock<HashMap<ConnectionKey, Weak<MqttConnection>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the existing connection for `key`, or opens a new one using
    /// `config`, publishing its discovery and lifecycle events on `events`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if a new connection needs to be opened and
    /// fails to construct.
    pub fn get_or_connect(
        &self,
        key: ConnectionKey,
        config: &MqttConnectionConfig,
        events: EventBus,
    ) -> Result<Arc<MqttConnection>, TransportError> {
        if let Some(existing) = self.connections.read().get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let seed = format!("{}-{}-{}", key.profile_id, key.host, key.port);
        let connection = MqttConnection::connect(&seed, config, events)?;
        self.connections.write().insert(key, Arc::downgrade(&connection));
        Ok(connection)
    }

    /// Drops pool entries whose connection has no remaining strong references.
    pub fn cleanup(&self) {
        self.connections.write().retain(|_, weak| weak.strong_count() > 0);
    }

    /// The number of connections currently alive in the pool.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_key_distinguishes_profiles_on_same_broker() {
        let a = ConnectionKey::new("profile-a", "broker.local", 1883);
        let b = ConnectionKey::new("profile-b", "broker.local", 1883);
        assert_ne!(a, b);
    }

    #[test]
    fn connection_key_equality() {
        let a = ConnectionKey::new("profile-a", "broker.local", 1883);
        let b = ConnectionKey::new("profile-a", "broker.local", 1883);
        assert_eq!(a, b);
    }

    #[test]
    fn pool_starts_empty() {
        let pool = ConnectionPool::new();
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn get_or_connect_reuses_existing_connection() {
        let pool = ConnectionPool::new();
        let key = ConnectionKey::new("profile-a", "localhost", 1883);
        let config = MqttConnectionConfig::new("localhost", 1883);

        let first = pool.get_or_connect(key.clone(), &config, EventBus::new()).unwrap();
        let second = pool.get_or_connect(key, &config, EventBus::new()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn cleanup_drops_unreferenced_connections() {
        let pool = ConnectionPool::new();
        let key = ConnectionKey::new("profile-a", "localhost", 1883);
        let config = MqttConnectionConfig::new("localhost", 1883);
        {
            let _connection = pool.get_or_connect(key, &config, EventBus::new()).unwrap();
            assert_eq!(pool.connection_count(), 1);
        }
        pool.cleanup();
        assert_eq!(pool.connection_count(), 0);
    }
}
