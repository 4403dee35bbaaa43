//! Capped exponential backoff for the publish retry loop
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! There is no attempt limit: the publish loop retries until it succeeds or
//! its caller cancels.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }
}

impl Backoff {
    /// `max` below `initial` is raised to `initial`; multipliers below 1.0 are
    /// treated as 1.0 (constant delay).
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier,
            attempt: 0,
        }
    }

    /// Delay before the next retry; grows on every call until the cap
    pub fn next_sleep(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt = self.attempt.saturating_add(1);
        let grown = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = if grown >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(grown)
        };
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
