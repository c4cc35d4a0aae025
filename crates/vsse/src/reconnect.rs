//! Reconnect delay computation.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Progress through a backoff sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Failed attempts since the last successful open.
    pub attempt: u32,
    /// The most recently returned delay.
    pub current_delay: Duration,
}

/// Exponential backoff with symmetric jitter.
///
/// `ideal = min(max, base × factor^attempt)`; the returned delay is
/// `ideal × (1 + u)` for `u` uniform in `[-jitter, +jitter]`, floored at zero
/// and capped at `max`. The random source is a parameter so sequences are
/// reproducible with a seeded rng.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// A fresh state with zero attempts.
    pub fn reset(&self) -> BackoffState {
        BackoffState::default()
    }

    /// The un-jittered delay for `attempt`.
    pub fn ideal_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base.as_secs_f64();
        let max = self.config.max.as_secs_f64();
        let exponent = self
            .config
            .factor
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let ideal = (base * exponent).min(max);
        if ideal.is_finite() {
            Duration::from_secs_f64(ideal.max(0.0))
        } else {
            self.config.max
        }
    }

    /// Compute the delay before the next attempt and advance the state.
    pub fn next_delay<R: Rng>(
        &self,
        state: BackoffState,
        rng: &mut R,
    ) -> (Duration, BackoffState) {
        let ideal = self.ideal_delay(state.attempt).as_secs_f64();
        let jitter = self.config.jitter;

        let factor = if jitter > 0.0 {
            1.0 + rng.random_range(-jitter..=jitter)
        } else {
            1.0
        };
        let jittered = (ideal * factor)
            .max(0.0)
            .min(self.config.max.as_secs_f64());
        let delay = Duration::from_secs_f64(jittered);

        (
            delay,
            BackoffState {
                attempt: state.attempt.saturating_add(1),
                current_delay: delay,
            },
        )
    }

    /// The delay to use when the server sent a `retry:` directive.
    ///
    /// The server's value replaces the computed delay but still respects the
    /// configured maximum.
    pub fn server_delay(&self, state: BackoffState, retry: Duration) -> (Duration, BackoffState) {
        let delay = retry.min(self.config.max);
        (
            delay,
            BackoffState {
                attempt: state.attempt.saturating_add(1),
                current_delay: delay,
            },
        )
    }
}
