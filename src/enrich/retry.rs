//! Bounded retry with a fixed delay, plus the pacing pause between fields.
use crate::config::ProcessingConfig;
use anyhow::Result;
use std::time::Duration;

/// Blocking pause; swapped out in tests.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Outcome of a retried operation. Exhaustion is a value, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempted<T> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { attempts: u32, last_error: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
    pacing: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration, pacing: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            pacing,
        }
    }

    pub fn from_config(processing: &ProcessingConfig) -> Self {
        Self::new(
            processing.retry_attempts,
            seconds(processing.retry_delay),
            seconds(processing.sleep_time),
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Call `operation` until it yields a value or the attempts run out.
    ///
    /// `Err` and `Ok(None)` both count as failed attempts. The delay is slept
    /// between attempts only, never after the last one.
    pub fn run<T>(
        &self,
        sleeper: &dyn Sleeper,
        mut operation: impl FnMut(u32) -> Result<Option<T>>,
    ) -> Attempted<T> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match operation(attempt) {
                Ok(Some(value)) => {
                    return Attempted::Succeeded {
                        value,
                        attempts: attempt,
                    }
                }
                Ok(None) => {
                    tracing::warn!(attempt, max_attempts = self.attempts, "empty response");
                    last_error = Some("empty response".to_string());
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    tracing::warn!(
                        attempt,
                        max_attempts = self.attempts,
                        error = %message,
                        "attempt failed"
                    );
                    last_error = Some(message);
                }
            }
            if attempt < self.attempts {
                sleeper.sleep(self.delay);
            }
        }
        Attempted::Exhausted {
            attempts: self.attempts,
            last_error,
        }
    }

    /// Pause applied after every field, whatever its outcome.
    pub fn pace(&self, sleeper: &dyn Sleeper) {
        sleeper.sleep(self.pacing);
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
