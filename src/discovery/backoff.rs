//! Exponential backoff schedule for the discovery handshakes.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::BackoffConfig;

/// Iterator-style backoff: each call yields the next wait, or `None` once
/// the elapsed budget is spent.
pub(crate) struct ExponentialBackoff {
    current: Duration,
    multiplier: f64,
    randomization_factor: f64,
    max_interval: Duration,
    deadline: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> ExponentialBackoff {
        ExponentialBackoff {
            current: config.initial_interval(),
            multiplier: config.multiplier,
            randomization_factor: config.randomization_factor,
            max_interval: config.max_interval(),
            deadline: Instant::now() + config.max_elapsed(),
        }
    }

    /// Next wait, jittered by the randomization factor, or `None` when the
    /// total budget is exhausted.
    pub fn next_interval(&mut self) -> Option<Duration> {
        if Instant::now() >= self.deadline {
            return None;
        }

        let jitter = if self.randomization_factor > 0.0 {
            let spread = rand::thread_rng().gen_range(-1.0..=1.0);
            1.0 + self.randomization_factor * spread
        } else {
            1.0
        };
        let wait = self.current.mul_f64(jitter);

        self.current = self.current.mul_f64(self.multiplier).min(self.max_interval);
        Some(wait)
    }
}
