//! Activation-window timeout policy and the engine clock.
//!
//! The timeout is a pull-based guard: nothing fires on its own. An Active
//! trade past its window stays Active until somebody calls the refund.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of "now" for the engine.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used for simulations and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Timeout policy
// ---------------------------------------------------------------------------

const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    window: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_secs(300)
    }
}

impl TimeoutPolicy {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Window of `secs` seconds, capped at roughly a century.
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Earliest instant at which the refund becomes available.
    pub fn deadline(&self, activation_time: DateTime<Utc>) -> DateTime<Utc> {
        activation_time + self.window
    }

    /// `now - activation_time >= window`.
    pub fn has_elapsed(&self, activation_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - activation_time >= self.window
    }

    /// Time left before the window elapses (zero once it has).
    pub fn remaining(&self, activation_time: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let left = self.deadline(activation_time) - now;
        if left < Duration::zero() {
            Duration::zero()
        } else {
            left
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
