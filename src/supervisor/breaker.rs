use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window restart limiter. Once more than `max_restarts` restarts
/// would fall inside `window`, the breaker trips and stays tripped until
/// reset.
#[derive(Debug)]
pub struct CircuitBreaker {
    window: Duration,
    max_restarts: usize,
    restarts: VecDeque<Instant>,
    tripped: bool,
}

impl CircuitBreaker {
    pub fn new(max_restarts: usize, window: Duration) -> Self {
        Self {
            window,
            max_restarts,
            restarts: VecDeque::with_capacity(max_restarts + 1),
            tripped: false,
        }
    }

    /// Ask permission to restart at `now`. Returns false, and trips, when the
    /// window is already full.
    pub fn try_restart(&mut self, now: Instant) -> bool {
        if self.tripped {
            return false;
        }
        self.prune(now);
        if self.restarts.len() >= self.max_restarts {
            self.tripped = true;
            return false;
        }
        self.restarts.push_back(now);
        true
    }

    pub fn restarts_in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.restarts.len()
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn reset(&mut self) {
        self.restarts.clear();
        self.tripped = false;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.restarts.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }
}
