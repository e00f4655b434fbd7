//! Exponential reconnect backoff with jitter.

use rand::Rng;
use std::time::Duration;

pub const DEFAULT_JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            jitter: DEFAULT_JITTER,
            attempt: 0,
        }
    }

    /// Fraction of each delay randomly added or removed. Clamped to [0, 1].
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.attempt.min(31);
        self.attempt += 1;

        let raw = self.base.saturating_mul(1u32 << exp).min(self.cap);
        if self.jitter == 0.0 {
            return Some(raw);
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Some(raw.mul_f64(factor).min(self.cap))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
