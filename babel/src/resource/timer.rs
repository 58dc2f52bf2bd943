// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use once_cell::sync::OnceCell;

/// Shared reference between a settled duration and the timer that fills it.
type DurationCell = Arc<OnceCell<Duration>>;

/// The optional duration settled by a [`UsageTimer`]. Created empty; trace
/// consumers read it after the timed scope finishes.
#[derive(Default, Debug, Clone)]
pub struct UsageDuration(Option<DurationCell>);

impl UsageDuration {
    pub fn get(&self) -> Option<&Duration> {
        self.0.as_ref().and_then(|d| d.get())
    }
}

/// A handle measuring the CPU-time cost of a scope. Obtained from a
/// limiter's `time_cpu`; the elapsed time is charged to the component when
/// the timer is finished (or dropped).
#[must_use]
#[derive(Debug)]
pub struct UsageTimer {
    start: Instant,
    elapsed: DurationCell,
}

impl UsageTimer {
    /// Convenience to capture a start instant before the timer exists.
    pub fn start() -> Instant {
        Instant::now()
    }

    pub(crate) fn new(duration: &mut UsageDuration) -> Self {
        assert!(
            duration.get().is_none(),
            "UsageDuration::elapsed already set!"
        );
        let cell = match &duration.0 {
            Some(cell) => cell.clone(),
            None => {
                let cell = DurationCell::default();
                duration.0 = Some(cell.clone());
                cell
            }
        };
        UsageTimer {
            start: Instant::now(),
            elapsed: cell,
        }
    }

    /// Record the elapsed time since the timer was created.
    pub fn stop(self) -> Duration {
        let start = self.start;
        self.stop_with(start)
    }

    /// Record the elapsed time since an externally captured instant.
    pub fn stop_with(self, start: Instant) -> Duration {
        let elapsed = start.elapsed();
        let ok = self.elapsed.set(elapsed).is_ok();
        debug_assert!(ok, "UsageTimer stopped twice");
        elapsed
    }
}
