//! # Exponential Backoff
//!
//! Purpose: Generate the delay sequence used for command retries and
//! deferred-queue re-attempts.
//!
//! Without jitter the sequence is `base, factor*base, factor^2*base, ...`
//! capped at `max`. With jitter each value is drawn uniformly from
//! `[d/2, 3d/2]` to spread synchronized retries apart.

use std::time::Duration;

use rand::Rng;

/// Default base delay.
pub const DEFAULT_BASE: Duration = Duration::from_millis(100);
/// Default growth factor.
pub const DEFAULT_FACTOR: f64 = 2.0;
/// Default cap on a single delay.
pub const DEFAULT_MAX: Duration = Duration::from_secs(30);
/// Growth factor for deferred-queue re-attempts.
pub const QUEUE_FACTOR: f64 = 1.5;

/// Exponential delay generator with optional jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff with explicit parameters.
    pub fn new(base: Duration, factor: f64, max: Duration, jitter: bool) -> Self {
        Backoff {
            base,
            factor,
            max,
            jitter,
            attempt: 0,
        }
    }

    /// Backoff used between command retries.
    pub fn for_retries() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_FACTOR, DEFAULT_MAX, true)
    }

    /// Backoff used between deferred-queue re-attempts.
    pub fn for_queueing() -> Self {
        Self::new(DEFAULT_BASE, QUEUE_FACTOR, DEFAULT_MAX, true)
    }

    /// Yields the next delay and advances the sequence.
    pub fn next_duration(&mut self) -> Duration {
        let exp = self.factor.powi(self.attempt as i32);
        let raw = self.base.as_secs_f64() * exp;
        let capped = raw.min(self.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        if !self.jitter {
            return Duration::from_secs_f64(capped);
        }
        let scale = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * scale)
    }

    /// Restores the sequence to its initial state.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::for_retries()
    }
}
