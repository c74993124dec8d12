// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A protocol client and state manager for consumer appliances that speak a
//! shared JSON-over-HTTP/JSON-over-MQTT control protocol.
//!
//! Each device is driven by a [`DeviceEngine`](engine::DeviceEngine) running
//! as its own `tokio` task: it selects between HTTP and MQTT, batches
//! outgoing namespace requests, adapts its polling cadence to the payload
//! sizes it observes, and reconciles the device's clock and timezone against
//! the host. Devices reached through a cloud account are grouped under a
//! [`Profile`](profile::Profile), which owns the shared MQTT connections and
//! the cloud device inventory. The [`Runtime`](registry::Runtime) is the
//! composition root tying engines and profiles together.
//!
//! # Feature Flags
//!
//! - `http` - Enables the HTTP transport (enabled by default)
//! - `mqtt` - Enables the MQTT transport and connection pooling (enabled by default)
//!
//! # Quick Start
//!
//! ```no_run
//! use applianceproto::engine::ConfiguredProtocol;
//! use applianceproto::event::DeviceId;
//! use applianceproto::registry::{DeviceConfig, Runtime};
//!
//! # fn example() -> applianceproto::Result<()> {
//! let runtime = Runtime::new();
//! let device_id = runtime.add_device(DeviceConfig {
//!     device_id: DeviceId::new("0123456789abcdef0123456789abcdef"),
//!     key: "device-key".into(),
//!     profile_id: None,
//!     protocol: ConfiguredProtocol::Auto,
//! })?;
//!
//! let mut events = runtime.events().subscribe();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod engine;
pub mod error;
pub mod event;
pub mod profile;
pub mod protocol;
pub mod registry;

pub use clock::{MonotonicClock, Timer};
pub use codec::{Envelope, Header, Method};
pub use engine::{ConfiguredProtocol, DeviceEngine, EngineMessage};
pub use error::{EngineError, Result, TransportError};
pub use event::{DeviceId, EngineEvent, EventBus};
pub use profile::{CloudApi, CloudToken, Profile, ProfileId, ProfileStore};
pub use registry::{DeviceConfig, Runtime};
