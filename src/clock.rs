// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A thin wrapper over `tokio::time` so engine scheduling logic can be
//! driven by a fake clock in tests (`#[tokio::test(start_paused = true)]`
//! plus `tokio::time::advance`, the same pattern the teacher uses in its own
//! `tokio::time`-based tests).

use std::time::Duration;

use tokio::time::Instant;

/// A handle to the runtime's monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// The current instant.
    #[must_use]
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Schedules a one-shot timer firing after `duration`.
    #[must_use]
    pub fn schedule(&self, duration: Duration) -> Timer {
        Timer {
            deadline: Instant::now() + duration,
        }
    }
}

/// A cancellable scheduled wakeup. Dropping it is equivalent to cancelling.
#[derive(Debug)]
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    /// Waits until the timer's deadline.
    pub async fn wait(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }

    /// The instant this timer will fire.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Cancels the timer. A no-op beyond dropping it; named for readability
    /// at call sites that intend to stop a scheduled wakeup.
    pub fn cancel(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_duration() {
        let clock = MonotonicClock;
        let start = clock.now();
        let timer = clock.schedule(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(5)).await;
        timer.wait().await;
        assert!(clock.now() >= start + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_without_panic() {
        let clock = MonotonicClock;
        let timer = clock.schedule(Duration::from_secs(1));
        timer.cancel();
    }
}
