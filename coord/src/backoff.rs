//! Capped exponential backoff and the poll loop built on it
//!
//! Both directions of the protocol wait the same way: the worker polls for the
//! controller's state, the controller polls for worker acks. [`wait_for`] is
//! that loop, parameterized by the check closure.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// First interval
    pub initial: Duration,
    /// Multiplier applied after each interval
    pub factor: f64,
    /// Upper bound for any interval
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self { initial, factor, max }
    }

    /// Infinite sequence of poll intervals
    pub fn intervals(&self) -> Backoff {
        Backoff {
            next: self.initial.min(self.max),
            factor: if self.factor.is_finite() { self.factor.max(1.0) } else { 1.0 },
            max: self.max,
        }
    }
}

/// Iterator of non-decreasing intervals capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    factor: f64,
    max: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        // Scale in whole nanoseconds so 100ms * 1.5 is exactly 150ms
        let scaled = current.as_nanos() as f64 * self.factor;
        self.next = if scaled < self.max.as_nanos() as f64 {
            Duration::from_nanos(scaled.round() as u64).max(current)
        } else {
            self.max
        };
        Some(current)
    }
}

/// A poll loop ran out of time
#[derive(Debug, Clone, Error, PartialEq)]
#[error("timed out after {elapsed:?} (limit {timeout:?}, {attempts} checks)")]
pub struct WaitTimeout {
    /// Wall-clock time spent in the loop
    pub elapsed: Duration,
    /// Configured limit
    pub timeout: Duration,
    /// Number of times the check ran
    pub attempts: u32,
}

/// Poll `check` until it yields a value or `timeout` elapses
///
/// The check runs immediately, then after each interval from `policy`. The
/// last sleep is shortened to the time remaining, so the loop returns within
/// one check of the deadline.
pub fn wait_for<T, F>(policy: &BackoffPolicy, timeout: Duration, mut check: F) -> Result<T, WaitTimeout>
where
    F: FnMut() -> Option<T>,
{
    debug!(?timeout, ?policy, "wait_for: called");
    let start = Instant::now();
    let mut intervals = policy.intervals();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = check() {
            debug!(attempts, elapsed = ?start.elapsed(), "wait_for: check succeeded");
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            debug!(attempts, ?elapsed, "wait_for: timed out");
            return Err(WaitTimeout {
                elapsed,
                timeout,
                attempts,
            });
        }

        let interval = intervals.next().unwrap_or(policy.max);
        thread::sleep(interval.min(timeout - elapsed));
    }
}
