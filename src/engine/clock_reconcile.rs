// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device clock drift reconciliation.
//!
//! Grounded on `meross_device.py`'s `_config_device_timestamp`: the engine
//! tracks a smoothed estimate of `device_time - host_time` and, when the
//! estimate drifts past a tolerance, pushes a `SYSTEM_CLOCK` correction. Two
//! independent cooldowns gate re-pushing and gate the passive warning log
//! issued when no push is possible (e.g. no `SYSTEM_CLOCK` ability, or a
//! cloud-bridged device) — these are separate timers in the original
//! implementation and stay separate here.

use std::time::{Duration, Instant};

/// Drift beyond this many seconds triggers a correction.
pub const TOLERANCE_SECS: i64 = 5;
/// Minimum time between two `SYSTEM_CLOCK` pushes.
pub const PUSH_COOLDOWN: Duration = Duration::from_secs(1800);
/// Suppresses reacting to the transient delta spike right after a push.
pub const PUSH_DEADZONE: Duration = Duration::from_secs(30);
/// Minimum time between two passive "can't correct clock" warnings.
pub const WARN_LOCKOUT: Duration = Duration::from_secs(604_800);

/// Tracks smoothed clock delta and the two independent cooldown gates.
#[derive(Debug, Default)]
pub struct ClockReconciler {
    smoothed_delta: i64,
    last_push: Option<Instant>,
    last_push_deadzone_until: Option<Instant>,
    last_warn: Option<Instant>,
}

/// What the engine should do after observing a new delta sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAction {
    /// No action: within tolerance, or cooling down.
    None,
    /// Push a `SYSTEM_CLOCK` correction with this device-visible timestamp offset.
    Push,
    /// Can't push (no ability / cloud-bridged) and the warn lockout has elapsed.
    Warn,
}

impl ClockReconciler {
    /// Creates a reconciler with zero smoothed delta and all gates open.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current smoothed delta estimate, in seconds (device minus host).
    #[must_use]
    pub fn smoothed_delta(&self) -> i64 {
        self.smoothed_delta
    }

    /// Feeds in a freshly observed `device_time - host_time` sample (seconds),
    /// smoothing it via `(4*previous + new) / 5`, and decides what to do.
    pub fn observe(&mut self, now: Instant, raw_delta: i64, can_push: bool) -> ClockAction {
        if let Some(deadzone_until) = self.last_push_deadzone_until
            && now < deadzone_until
        {
            return ClockAction::None;
        }

        self.smoothed_delta = (4 * self.smoothed_delta + raw_delta) / 5;

        if self.smoothed_delta.abs() <= TOLERANCE_SECS {
            return ClockAction::None;
        }

        if can_push {
            let due = self
                .last_push
                .is_none_or(|last| now.duration_since(last) >= PUSH_COOLDOWN);
            if due {
                self.last_push = Some(now);
                self.last_push_deadzone_until = Some(now + PUSH_DEADZONE);
                return ClockAction::Push;
            }
            return ClockAction::None;
        }

        let due = self
            .last_warn
            .is_none_or(|last| now.duration_since(last) >= WARN_LOCKOUT);
        if due {
            self.last_warn = Some(now);
            ClockAction::Warn
        } else {
            ClockAction::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_tolerance_is_a_noop() {
        let mut reconciler = ClockReconciler::new();
        assert_eq!(
            reconciler.observe(Instant::now(), 2, true),
            ClockAction::None
        );
    }

    #[test]
    fn large_drift_pushes_once_then_cools_down() {
        let mut reconciler = ClockReconciler::new();
        let now = Instant::now();
        assert_eq!(reconciler.observe(now, 100, true), ClockAction::Push);
        // immediately after: deadzone suppresses further reaction
        assert_eq!(reconciler.observe(now, 100, true), ClockAction::None);
    }

    #[test]
    fn cannot_push_warns_once_then_locks_out() {
        let mut reconciler = ClockReconciler::new();
        let now = Instant::now();
        assert_eq!(reconciler.observe(now, 100, false), ClockAction::Warn);
        assert_eq!(reconciler.observe(now, 100, false), ClockAction::None);
    }

    #[test]
    fn smoothing_converges_toward_new_samples() {
        let mut reconciler = ClockReconciler::new();
        let now = Instant::now();
        for _ in 0..50 {
            reconciler.observe(now + PUSH_DEADZONE + Duration::from_secs(1), 50, false);
        }
        assert!((reconciler.smoothed_delta() - 50).abs() <= 1);
    }
}
