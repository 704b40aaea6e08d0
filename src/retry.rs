use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter shared by connection and download retries.
///
/// `max_attempts == 0` means retry forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

/// Fraction of the current delay applied as random jitter in either direction
const JITTER_RATIO: f64 = 0.1;

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == 0
    }

    /// Whether attempt number `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        self.is_unbounded() || attempt <= self.max_attempts
    }

    /// Start a fresh delay sequence for one logical operation
    pub fn backoff(&self) -> Backoff {
        Backoff {
            current: self.base_delay,
            max: self.max_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1), Duration::from_secs(300))
    }
}

/// Delay sequence of one retried operation
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    /// Jittered delay to sleep before the next attempt; doubles the base for the one after
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::rng().random_range(-JITTER_RATIO..=JITTER_RATIO);
        let delay = self.current.mul_f64(1.0 + jitter).min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Sleep for the next delay and return it
    pub async fn wait(&mut self) -> Duration {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
        delay
    }
}
