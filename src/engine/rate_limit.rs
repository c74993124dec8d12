// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rate-gates host-visible advisories so a flapping device can't flood the
//! event bus with repeats of the same complaint.
//!
//! Grounded on the original's weekly and 30-minute key/identity lockouts,
//! generalized into one `(Code, DeviceId)`-keyed gate rather than two
//! single-purpose timers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::event::DeviceId;

/// The advisory categories that get rate-gated. Transient transport retries
/// are not in this set; only the handful of events that escalate to the
/// host application need gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// `EngineEvent::IdentityMismatch`.
    IdentityMismatch,
    /// `EngineEvent::KeyError`.
    KeyError,
    /// `EngineEvent::TimezoneAdvisory`.
    TimezoneAdvisory,
}

/// Minimum interval between repeats of the same `(Code, DeviceId)` pair.
const MIN_INTERVAL: Duration = Duration::from_secs(1800);

/// A `HashMap`-backed gate: tracks when each `(Code, DeviceId)` pair last
/// fired and refuses a repeat inside [`MIN_INTERVAL`].
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_fired: HashMap<(Code, DeviceId), Instant>,
}

impl RateLimiter {
    /// An empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records `now` if `(code, device_id)` hasn't fired
    /// inside the minimum interval; returns `false` without recording
    /// otherwise.
    pub fn allow(&mut self, code: Code, device_id: &DeviceId, now: Instant) -> bool {
        match self.last_fired.get(&(code, device_id.clone())) {
            Some(last) if now.duration_since(*last) < MIN_INTERVAL => false,
            _ => {
                self.last_fired.insert((code, device_id.clone()), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fire_is_always_allowed() {
        let mut limiter = RateLimiter::new();
        assert!(limiter.allow(Code::KeyError, &DeviceId::new("abc"), Instant::now()));
    }

    #[test]
    fn repeat_within_interval_is_suppressed() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.allow(Code::KeyError, &DeviceId::new("abc"), now));
        assert!(!limiter.allow(Code::KeyError, &DeviceId::new("abc"), now + Duration::from_secs(60)));
    }

    #[test]
    fn repeat_after_interval_is_allowed_again() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.allow(Code::KeyError, &DeviceId::new("abc"), now));
        assert!(limiter.allow(Code::KeyError, &DeviceId::new("abc"), now + MIN_INTERVAL + Duration::from_secs(1)));
    }

    #[test]
    fn distinct_codes_are_independent() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.allow(Code::KeyError, &DeviceId::new("abc"), now));
        assert!(limiter.allow(Code::IdentityMismatch, &DeviceId::new("abc"), now));
    }

    #[test]
    fn distinct_devices_are_independent() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.allow(Code::KeyError, &DeviceId::new("abc"), now));
        assert!(limiter.allow(Code::KeyError, &DeviceId::new("def"), now));
    }
}
