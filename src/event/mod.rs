// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-visible event system.
//!
//! Most engine failures are absorbed internally (health flags, retry
//! scheduling) and never reach a host application. [`EngineEvent`] carries
//! only the conditions a host needs to act on — device lifecycle, online
//! transitions, identity mismatches, key errors, and timezone advisories.
//!
//! ```
//! use applianceproto::event::{DeviceId, EngineEvent, EventBus};
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! let device_id = DeviceId::new("abc123");
//! bus.publish(EngineEvent::DeviceAdded { device_id });
//! ```

mod device_event;
mod device_id;
mod event_bus;

pub use device_event::EngineEvent;
pub use device_id::DeviceId;
pub use event_bus::EventBus;
