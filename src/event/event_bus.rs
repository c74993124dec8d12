// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event bus for broadcasting engine events to host applications.
//!
//! A thin wrapper over `tokio::sync::broadcast`, but `publish` logs every
//! event at a level keyed to what it is: lifecycle events (a device being
//! added/removed from the runtime) are operationally uninteresting and log
//! at `debug`, everything else — identity mismatches, key errors, advisories —
//! is something a host may have missed a subscriber for, so it logs at `warn`
//! when nobody was listening.

use tokio::sync::broadcast;

use super::EngineEvent;

/// Default channel capacity for the event bus.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting device events to multiple subscribers.
///
/// Each subscriber gets its own copy of each event. If the channel fills up
/// because a subscriber is slow, older events may be dropped for that
/// subscriber (it receives a `RecvError::Lagged` error on its next `recv`).
///
/// # Examples
///
/// ```
/// use applianceproto::event::{DeviceId, EngineEvent, EventBus};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(EngineEvent::DeviceAdded {
///     device_id: DeviceId::new("abc123"),
/// });
/// ```
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Creates a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a new event bus with the specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to engine events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event to all subscribers, logging it at a level keyed to
    /// its kind (`debug` for lifecycle events, `warn` for everything else
    /// when nobody received it — a host that never subscribes never finds
    /// out its device went offline or hit a key error).
    pub fn publish(&self, event: EngineEvent) {
        let received = self.sender.send(event.clone()).unwrap_or(0);
        if event.is_lifecycle() {
            tracing::debug!(device = %event.device_id(), event = ?event, "lifecycle event");
        } else if received == 0 {
            tracing::warn!(device = %event.device_id(), event = ?event, "published with no subscribers");
        } else {
            tracing::trace!(device = %event.device_id(), event = ?event, receivers = received, "published");
        }
    }

    /// Publishes an event and returns the number of receivers that received it.
    #[must_use]
    pub fn publish_counted(&self, event: EngineEvent) -> usize {
        let device_id = event.device_id().clone();
        let count = self.sender.send(event).unwrap_or(0);
        tracing::trace!(device = %device_id, receivers = count, "published");
        count
    }

    /// Publishes every event in `events`, in order. Used by callers that
    /// raise several related events from a single state transition (e.g. a
    /// discovery sweep that both completes a device and changes its
    /// abilities) and want them delivered together rather than interleaved.
    pub fn publish_many(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DeviceId;

    #[test]
    fn new_bus_has_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn subscribe_increments_count() {
        let bus = EventBus::new();

        let _rx1 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn drop_subscriber_decrements_count() {
        let bus = EventBus::new();

        let rx1 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let device_id = DeviceId::new("device-1");
        bus.publish(EngineEvent::DeviceAdded {
            device_id: device_id.clone(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.device_id(), &device_id);
    }

    #[tokio::test]
    async fn publish_delivers_to_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let device_id = DeviceId::new("device-1");
        bus.publish(EngineEvent::DeviceAdded {
            device_id: device_id.clone(),
        });

        let event1 = rx1.recv().await.unwrap();
        let event2 = rx2.recv().await.unwrap();

        assert_eq!(event1.device_id(), &device_id);
        assert_eq!(event2.device_id(), &device_id);
    }

    #[test]
    fn publish_counted_returns_receiver_count() {
        let bus = EventBus::new();
        let _rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();

        let device_id = DeviceId::new("device-1");
        let count = bus.publish_counted(EngineEvent::DeviceAdded { device_id });

        assert_eq!(count, 2);
    }

    #[test]
    fn publish_counted_returns_zero_without_subscribers() {
        let bus = EventBus::new();
        let device_id = DeviceId::new("device-1");
        let count = bus.publish_counted(EngineEvent::DeviceAdded { device_id });

        assert_eq!(count, 0);
    }

    #[test]
    fn clone_shares_same_channel() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();

        let _rx = bus1.subscribe();
        // Subscriber from bus1 should be visible in bus2
        assert_eq!(bus2.subscriber_count(), 1);
    }

    #[test]
    fn with_capacity_creates_bus() {
        let bus = EventBus::with_capacity(512);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_many_delivers_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let device_id = DeviceId::new("device-1");

        bus.publish_many([
            EngineEvent::Online {
                device_id: device_id.clone(),
                online: true,
            },
            EngineEvent::AbilitiesChanged {
                device_id: device_id.clone(),
            },
        ]);

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::Online { online: true, .. }));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::AbilitiesChanged { .. }));
    }
}
