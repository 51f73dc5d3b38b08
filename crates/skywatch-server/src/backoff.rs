//! Exponential reconnect backoff with jitter for the feed connection.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    next_attempt_at: Instant,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            base,
            max: max.max(base),
            current: base,
            next_attempt_at: Instant::now(),
            jitter_ratio: 0.2,
        }
    }

    pub fn ready(&self) -> bool {
        Instant::now() >= self.next_attempt_at
    }

    /// Time left before the next attempt is allowed.
    pub fn remaining(&self) -> Duration {
        self.next_attempt_at.saturating_duration_since(Instant::now())
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.next_attempt_at = Instant::now();
    }

    /// Record a failed attempt and return the delay before the next one.
    pub fn fail(&mut self) -> Duration {
        let delay = jittered(self.current, self.jitter_ratio, uuid::Uuid::new_v4().as_u128());
        self.next_attempt_at = Instant::now() + delay;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

fn jittered(delay: Duration, ratio: f64, seed: u128) -> Duration {
    if !(0.0..=1.0).contains(&ratio) {
        return delay;
    }
    let jitter_max = (delay.as_millis() as f64 * ratio) as u128;
    if jitter_max == 0 {
        return delay;
    }
    delay + Duration::from_millis((seed % (jitter_max + 1)) as u64)
}
