use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};
use tokio::time::Instant;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug)]
struct Failure {
    attempts: u32,
    retry_at: Instant,
    generation: Option<i64>,
}

/// Per object capped exponential backoff.
///
/// Status writes done by a failing reconcile trigger watch events of their
/// own, so the delay is also enforced when the object comes back early.
/// A new spec generation lifts the gate.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, Failure>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay after the given number of consecutive failures (1 based)
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn failed(&self, key: &str, generation: Option<i64>) -> Duration {
        let Ok(mut failures) = self.failures.lock() else {
            return self.max;
        };
        let now = Instant::now();
        // nobody came back for these within a full max delay: the object is gone
        failures.retain(|_, f| f.retry_at + self.max > now);
        let attempts = failures.get(key).map_or(0, |f| f.attempts) + 1;
        let delay = self.delay(attempts);
        failures.insert(key.to_string(), Failure {
            attempts,
            retry_at: now + delay,
            generation,
        });
        delay
    }

    /// Remaining wait for a key still in backoff for this generation
    #[must_use]
    pub fn pending(&self, key: &str, generation: Option<i64>) -> Option<Duration> {
        let failures = self.failures.lock().ok()?;
        let failure = failures.get(key)?;
        if failure.generation != generation {
            return None;
        }
        let now = Instant::now();
        (failure.retry_at > now).then(|| failure.retry_at - now)
    }

    #[must_use]
    pub fn attempts(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .ok()
            .and_then(|f| f.get(key).map(|f| f.attempts))
            .unwrap_or(0)
    }

    /// Number of keys currently tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.lock().map_or(0, |f| f.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }
}
