//! Stream liveness supervision.
//!
//! The monitor is a plain state machine over [`Instant`]s; the connection
//! driver owns it and sleeps until [`HeartbeatMonitor::deadline`].

use std::time::{Duration, Instant};

/// Result of [`HeartbeatMonitor::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// Not armed, or heartbeat supervision is disabled.
    Disarmed,
    /// Activity arrived within the threshold.
    Alive,
    /// No activity for `silence`. Reported once per arming.
    Stalled { silence: Duration },
    /// Already reported as stalled; waiting to be re-armed.
    AwaitingRearm,
}

/// Tracks the last activity timestamp and reports a stall once.
#[derive(Clone, Debug)]
pub struct HeartbeatMonitor {
    enabled: bool,
    threshold: Duration,
    last_activity: Option<Instant>,
    fired: bool,
}

impl HeartbeatMonitor {
    /// Create a monitor with threshold `interval + tolerance`.
    pub fn new(enabled: bool, interval: Duration, tolerance: Duration) -> Self {
        Self {
            enabled,
            threshold: interval.saturating_add(tolerance),
            last_activity: None,
            fired: false,
        }
    }

    /// A monitor that never arms.
    pub fn disabled() -> Self {
        Self::new(false, Duration::ZERO, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_armed(&self) -> bool {
        self.last_activity.is_some()
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Start supervising from `now`. No-op when disabled.
    pub fn arm(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }
        self.last_activity = Some(now);
        self.fired = false;
    }

    /// Stop supervising.
    pub fn disarm(&mut self) {
        self.last_activity = None;
        self.fired = false;
    }

    /// Push the deadline out from `now`.
    pub fn record_activity(&mut self, now: Instant) {
        if let Some(last) = self.last_activity.as_mut()
            && !self.fired
            && now > *last
        {
            *last = now;
        }
    }

    /// When the next stall would be declared, if armed and not yet fired.
    pub fn deadline(&self) -> Option<Instant> {
        if self.fired {
            return None;
        }
        self.last_activity.map(|last| last + self.threshold)
    }

    /// Evaluate the monitor at `now`.
    pub fn check(&mut self, now: Instant) -> HeartbeatStatus {
        let Some(last) = self.last_activity else {
            return HeartbeatStatus::Disarmed;
        };
        if self.fired {
            return HeartbeatStatus::AwaitingRearm;
        }
        let silence = now.saturating_duration_since(last);
        if silence >= self.threshold {
            self.fired = true;
            HeartbeatStatus::Stalled { silence }
        } else {
            HeartbeatStatus::Alive
        }
    }
}
