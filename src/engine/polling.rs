// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-namespace polling strategies and the smart/cloud-rate-limited sweep.
//!
//! Grounded on `meross_device.py`'s `polling_dictionary` / `PollingStrategy`:
//! each namespace the device exposes gets its own cadence, and a device
//! reachable only through the cloud MQTT broker is swept at a slower,
//! configurable cloud period so as not to exhaust the account's rate limit.

use std::time::{Duration, Instant};

/// Ceiling `polling-delay` grows to while a device stays offline (the
/// heartbeat probing period).
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(300);
/// Slack subtracted from a namespace's period when judging whether a reply
/// arrived "recently enough" to consider the device still answering.
pub const RECENCY_SLACK: Duration = Duration::from_secs(2);
/// Default cap on how many cloud-routed sends one sweep may issue
/// ("smart" cloud-rate-limited polling).
pub const DEFAULT_CLOUD_QUEUE_MAX: usize = 1;

/// How a device should be addressed for a given round of requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfiguredProtocol {
    /// Try HTTP first, fall through to MQTT on failure.
    Auto,
    /// HTTP only; never attempt MQTT for this device.
    HttpOnly,
    /// MQTT only; never attempt HTTP for this device.
    MqttOnly,
}

/// The cadence and last-request bookkeeping for one namespace.
#[derive(Debug, Clone)]
pub struct PollingStrategy {
    namespace: String,
    period: Duration,
    cloud_period: Duration,
    last_request: Option<Instant>,
}

impl PollingStrategy {
    /// Creates a new strategy for `namespace`, polled at `period` normally and
    /// `cloud_period` when the device is only reachable via cloud MQTT.
    #[must_use]
    pub fn new(namespace: impl Into<String>, period: Duration, cloud_period: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            period,
            cloud_period,
            last_request: None,
        }
    }

    /// The namespace this strategy polls.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns `true` if this namespace is due for a request, given whether
    /// the device is currently being reached over cloud MQTT.
    #[must_use]
    pub fn is_due(&self, now: Instant, via_cloud: bool) -> bool {
        let period = if via_cloud { self.cloud_period } else { self.period };
        match self.last_request {
            None => true,
            Some(last) => now.duration_since(last) >= period,
        }
    }

    /// Records that a request for this namespace was just issued.
    pub fn mark_requested(&mut self, now: Instant) {
        self.last_request = Some(now);
    }
}

/// The device-level adaptive polling delay (`polling-delay`): starts at the
/// base period, grows by one base period per failed offline probe up to
/// [`HEARTBEAT_PERIOD`], and resets to the base period the instant the
/// device is seen answering again.
#[derive(Debug, Clone, Copy)]
pub struct PollingDelay {
    period: Duration,
    current: Duration,
}

impl PollingDelay {
    /// Creates a delay starting at `period`, the device's base polling cadence.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self { period, current: period }
    }

    /// The delay to wait before the next offline probe.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Resets to the base period, e.g. once the device answers again.
    pub fn reset(&mut self) {
        self.current = self.period;
    }

    /// Grows by one base period, capped at [`HEARTBEAT_PERIOD`].
    pub fn grow(&mut self) {
        let ceiling = HEARTBEAT_PERIOD.max(self.period);
        self.current = (self.current + self.period).min(ceiling);
    }
}

/// A cloud-rate-limited wrapper around [`PollingStrategy::is_due`]: adds a
/// per-sweep cap (`cloud_queue_max`) on top of the namespace's own cloud
/// period, so a device reachable only through cloud MQTT never has more than
/// a handful of namespaces sent in a single sweep regardless of how many are
/// simultaneously due.
#[must_use]
pub fn smart_poll_due(
    strategy: &PollingStrategy,
    now: Instant,
    via_cloud: bool,
    cloud_sent_this_sweep: usize,
    cloud_queue_max: usize,
) -> bool {
    if !strategy.is_due(now, via_cloud) {
        return false;
    }
    !(via_cloud && cloud_sent_this_sweep >= cloud_queue_max)
}

/// Sweeps `strategies`, returning the namespaces currently due, without
/// mutating any state — callers apply `mark_requested` only after a request
/// actually goes out, keeping the sweep-then-flush pass atomic.
#[must_use]
pub fn due_namespaces<'a>(
    strategies: &'a [PollingStrategy],
    now: Instant,
    via_cloud: bool,
) -> Vec<&'a str> {
    strategies
        .iter()
        .filter(|s| s.is_due(now, via_cloud))
        .map(PollingStrategy::namespace)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_poll_is_always_due() {
        let strategy = PollingStrategy::new(
            "Appliance.System.All",
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        assert!(strategy.is_due(Instant::now(), false));
    }

    #[test]
    fn not_due_until_period_elapses() {
        let mut strategy = PollingStrategy::new(
            "Appliance.System.All",
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        let now = Instant::now();
        strategy.mark_requested(now);
        assert!(!strategy.is_due(now, false));
    }

    #[test]
    fn cloud_period_is_slower() {
        let mut strategy = PollingStrategy::new(
            "Appliance.System.All",
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        let now = Instant::now();
        strategy.mark_requested(now);
        let later = now + Duration::from_secs(20);
        assert!(strategy.is_due(later, false));
        assert!(!strategy.is_due(later, true));
    }

    #[test]
    fn sweep_is_non_mutating() {
        let strategies = vec![PollingStrategy::new(
            "A",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )];
        let now = Instant::now();
        assert_eq!(due_namespaces(&strategies, now, false), vec!["A"]);
        assert_eq!(due_namespaces(&strategies, now, false), vec!["A"]);
    }

    #[test]
    fn polling_delay_grows_and_caps_at_heartbeat_period() {
        let mut delay = PollingDelay::new(Duration::from_secs(30));
        assert_eq!(delay.current(), Duration::from_secs(30));
        delay.grow();
        assert_eq!(delay.current(), Duration::from_secs(60));
        for _ in 0..20 {
            delay.grow();
        }
        assert_eq!(delay.current(), HEARTBEAT_PERIOD);
    }

    #[test]
    fn polling_delay_resets_to_base_period() {
        let mut delay = PollingDelay::new(Duration::from_secs(30));
        delay.grow();
        delay.grow();
        delay.reset();
        assert_eq!(delay.current(), Duration::from_secs(30));
    }

    #[test]
    fn smart_poll_due_respects_cloud_queue_max() {
        let mut strategy = PollingStrategy::new(
            "Appliance.System.All",
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        let now = Instant::now();
        strategy.mark_requested(now - Duration::from_secs(301));
        assert!(smart_poll_due(&strategy, now, true, 0, 1));
        assert!(!smart_poll_due(&strategy, now, true, 1, 1));
    }

    #[test]
    fn smart_poll_due_ignores_cloud_queue_max_when_not_via_cloud() {
        let mut strategy = PollingStrategy::new(
            "Appliance.System.All",
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        let now = Instant::now();
        strategy.mark_requested(now - Duration::from_secs(31));
        assert!(smart_poll_due(&strategy, now, false, 5, 1));
    }
}
