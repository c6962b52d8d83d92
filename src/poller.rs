//! Per-group poll loop.
//!
//! Each watched group gets one [`PollLoop`] task. The loop polls once right
//! after its initial delay (the startup scan), then on a fixed interval.
//! Ticks that arrive while a poll is still running are skipped rather than
//! queued, and a rate-limited poll also skips the following tick.
//!
//! The loop knows nothing about snapshots or timers; the watcher hands it a
//! closure that performs one poll and reports the outcome.

use crate::diff::Reconciliation;
use crate::error::Result;
use crate::model::GroupId;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing of one group's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    /// Wait before the first poll.
    pub initial_delay: Duration,
    /// Upper bound of the random offset added before the first periodic
    /// tick, so groups loaded together drift apart.
    pub jitter: Duration,
}

impl PollSchedule {
    /// Immediate first poll, then every `interval`, with up to a tenth of the
    /// interval (capped at 5s) of jitter.
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            initial_delay: Duration::ZERO,
            jitter: (interval / 10).min(Duration::from_secs(5)),
        }
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Result of one poll attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(Reconciliation),
    /// Another poll of the same group was still running.
    InFlight,
}

/// Drives one group's polls until cancelled.
pub struct PollLoop {
    group: GroupId,
    schedule: PollSchedule,
    cancel: CancellationToken,
}

impl PollLoop {
    pub fn new(group: GroupId, schedule: PollSchedule, cancel: CancellationToken) -> Self {
        Self {
            group,
            schedule,
            cancel,
        }
    }

    /// Run until the cancellation token fires. `poll` performs one poll.
    ///
    /// Cancellation also aborts a poll that is in progress.
    pub async fn run<F, Fut>(self, mut poll: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollOutcome>>,
    {
        let group = self.group;
        info!(
            group = %group,
            interval_secs = self.schedule.interval.as_secs(),
            "poll loop started"
        );

        if !self.schedule.initial_delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(group = %group, "poll loop cancelled before first poll");
                    return;
                }
                _ = tokio::time::sleep(self.schedule.initial_delay) => {}
            }
        }

        let mut skip_next = false;
        let first_tick = Instant::now() + self.schedule.interval + jitter(self.schedule.jitter);
        let mut ticker = tokio::time::interval_at(first_tick, self.schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The startup scan runs before the first periodic tick.
        let mut due = true;
        loop {
            if !due {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }
            due = false;

            if skip_next {
                skip_next = false;
                info!(group = %group, "skipping poll after rate limit");
                continue;
            }

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = poll() => outcome,
            };
            match outcome {
                Ok(PollOutcome::Completed(r)) => debug!(
                    group = %group,
                    scheduled = r.to_schedule.len(),
                    cancelled = r.to_cancel.len(),
                    transitions = r.immediate.len(),
                    tracked = r.next_state.len(),
                    "poll complete"
                ),
                Ok(PollOutcome::InFlight) => {
                    debug!(group = %group, "previous poll still running; tick skipped");
                }
                Err(e) if e.is_rate_limited() => {
                    warn!(group = %group, error = %e, "rate limited; backing off one interval");
                    skip_next = true;
                }
                Err(e) => warn!(group = %group, error = %e, "poll failed; keeping cached state"),
            }
        }

        info!(group = %group, "poll loop stopped");
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
