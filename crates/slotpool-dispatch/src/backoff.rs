//! Exponential backoff for upstream retries and slot relaunches.

use std::time::Duration;

use slotpool_core::BackoffConfig;

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`].
#[must_use]
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay())
}

/// Delay before the retry that follows `attempt` (1-based).
#[must_use]
pub fn delay_for_attempt(attempt: u32, config: &BackoffConfig) -> Duration {
    let mut delay = config.initial_delay().min(config.max_delay());
    for _ in 1..attempt {
        delay = next_delay(delay, config);
        if delay == config.max_delay() {
            break;
        }
    }
    delay
}

/// Stateful backoff sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Option<Duration>,
}

impl Backoff {
    /// Start a fresh sequence.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Next delay in the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.config.initial_delay().min(self.config.max_delay()),
            Some(current) => next_delay(current, &self.config),
        };
        self.current = Some(delay);
        delay
    }

    /// Restart from the initial delay.
    pub const fn reset(&mut self) {
        self.current = None;
    }
}
