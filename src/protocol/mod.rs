// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP and MQTT transports for the wire envelope defined in [`crate::codec`].
//!
//! # Feature Flags
//!
//! - `http` - Enables the HTTP transport (enabled by default)
//! - `mqtt` - Enables the MQTT transport and connection pool (enabled by default)

#[cfg(feature = "mqtt")]
mod broker_pool;
#[cfg(feature = "http")]
mod http;
#[cfg(feature = "mqtt")]
mod mqtt;

#[cfg(feature = "mqtt")]
pub use broker_pool::{ConnectionKey, ConnectionPool};
#[cfg(feature = "http")]
pub use http::{HttpConfig, HttpTransport, PostOutcome};
#[cfg(feature = "mqtt")]
pub use mqtt::{DiscoveryState, MqttConnection, MqttConnectionConfig};
