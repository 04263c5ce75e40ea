//! Call-counting throttle shared by every exchange adapter.
//!
//! Adapters count each API request with [`RateLimiter::record_call`]. When
//! a script calls `Sleep()` without an interval (or `E.AutoSleep()`), the
//! limiter pauses long enough that the calls made since the previous
//! pause average out to at most `limit` per second.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Calls per second allowed when the script never calls `SetLimit`.
pub const DEFAULT_LIMIT: f64 = 10.0;

/// Longest single pause, whatever the limit.
pub const MAX_PAUSE: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct LimiterState {
    limit: f64,
    calls: u64,
    last_sleep: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

impl RateLimiter {
    pub fn new(limit: f64) -> Self {
        Self::starting_at(limit, Instant::now())
    }

    fn starting_at(limit: f64, now: Instant) -> Self {
        let limit = if limit.is_finite() && limit > 0.0 { limit } else { DEFAULT_LIMIT };
        Self {
            state: Mutex::new(LimiterState {
                limit,
                calls: 0,
                last_sleep: now,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the allowed calls per second and return the limit now in force.
    /// Non-positive or non-finite values leave the current limit unchanged.
    pub fn set_limit(&self, limit: f64) -> f64 {
        let mut state = self.state();
        if limit.is_finite() && limit > 0.0 {
            state.limit = limit;
        }
        state.limit
    }

    pub fn limit(&self) -> f64 {
        self.state().limit
    }

    pub fn record_call(&self) {
        self.state().calls += 1;
    }

    pub fn calls(&self) -> u64 {
        self.state().calls
    }

    /// Pause owed at `now`, resetting the window as a side effect.
    ///
    /// `calls / limit` seconds of budget minus the time already elapsed
    /// since the last pause, floored at zero.
    pub(crate) fn next_pause(&self, now: Instant) -> Duration {
        let mut state = self.state();
        let budget = Duration::try_from_secs_f64(state.calls as f64 / state.limit)
            .unwrap_or(MAX_PAUSE)
            .min(MAX_PAUSE);
        let elapsed = now.saturating_duration_since(state.last_sleep);
        state.calls = 0;
        state.last_sleep = now;
        budget.saturating_sub(elapsed)
    }

    pub async fn auto_sleep(&self) {
        let pause = self.next_pause(Instant::now());
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
}
