//! Poll cadence computation.
//!
//! The scheduler is a pure function over explicit state: it never sleeps
//! and never reads a clock. The poller feeds it the previous delay, what
//! the last observation told us, and (while a run is executing) an
//! estimate learned from earlier runs of the same workflow.

use std::time::Duration;

const DEFAULT_INITIAL_DELAY_SECS: u64 = 10;
const DEFAULT_MIN_DELAY_SECS: u64 = 2;
const DEFAULT_MAX_DELAY_SECS: u64 = 120;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.4;
const DEFAULT_SPEED_UP_FACTOR: f64 = 0.7;
const DEFAULT_REMAINING_TIME_DIVISOR: u32 = 10;

/// Tunables for [`AdaptiveScheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Delay before the second poll of a watch.
    pub initial_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied when nothing changed.
    pub backoff_multiplier: f64,
    /// Shrink factor applied on progress or success.
    pub speed_up_factor: f64,
    /// How many polls to spread over the expected remaining run time.
    pub remaining_time_divisor: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(DEFAULT_INITIAL_DELAY_SECS),
            min_delay: Duration::from_secs(DEFAULT_MIN_DELAY_SECS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            speed_up_factor: DEFAULT_SPEED_UP_FACTOR,
            remaining_time_divisor: DEFAULT_REMAINING_TIME_DIVISOR,
        }
    }
}

impl SchedulerConfig {
    /// Rejects combinations that would make the clamp or the growth rules
    /// meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_delay.is_zero() {
            return Err("min delay must be greater than zero".into());
        }
        if self.min_delay > self.max_delay {
            return Err(format!(
                "min delay ({:?}) exceeds max delay ({:?})",
                self.min_delay, self.max_delay
            ));
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if !(self.speed_up_factor > 0.0 && self.speed_up_factor <= 1.0) {
            return Err(format!(
                "speed-up factor must be in (0, 1], got {}",
                self.speed_up_factor
            ));
        }
        if self.remaining_time_divisor == 0 {
            return Err("remaining time divisor must be at least 1".into());
        }
        Ok(())
    }
}

/// What history says about the run currently executing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearnedHint {
    pub average_build_duration: Duration,
    pub elapsed_since_watch_start: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Delay for the first sleep of a watch, clamped to bounds.
    pub fn initial_delay(&self) -> Duration {
        self.clamp(self.config.initial_delay)
    }

    /// Computes the delay before the next poll.
    ///
    /// Progress or success shrinks the delay by `speed_up_factor`; a quiet
    /// poll grows it by `backoff_multiplier`. While a run executes, a
    /// learned hint caps that growth at roughly `remaining / divisor` so
    /// polling tracks the expected completion time. The cap never pulls the
    /// delay below `current_delay`, which keeps backoff non-decreasing.
    pub fn next_delay(
        &self,
        current_delay: Duration,
        status_changed: bool,
        was_successful: bool,
        learned: Option<LearnedHint>,
    ) -> Duration {
        let current = self.clamp(current_delay);

        if was_successful || status_changed {
            let faster = self.scale(current, self.config.speed_up_factor);
            return self.clamp(faster);
        }

        let backed_off = self.clamp(self.scale(current, self.config.backoff_multiplier));

        match learned {
            Some(hint) => {
                let estimate = self.remaining_time_estimate(hint);
                self.clamp(backed_off.min(estimate).max(current))
            }
            None => backed_off,
        }
    }

    /// `max(min_delay, (average - elapsed) / divisor)`.
    pub fn remaining_time_estimate(&self, hint: LearnedHint) -> Duration {
        let remaining = hint
            .average_build_duration
            .saturating_sub(hint.elapsed_since_watch_start);
        (remaining / self.config.remaining_time_divisor).max(self.config.min_delay)
    }

    /// `delay * factor`, saturating at `max_delay` where the product does
    /// not fit a `Duration`.
    fn scale(&self, delay: Duration, factor: f64) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(self.config.max_delay)
    }

    fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.config.min_delay, self.config.max_delay)
    }
}
