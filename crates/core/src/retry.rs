//! Bounded retry with exponential backoff.
//!
//! Used to wrap side-effecting tool executions. No jitter: delays are
//! `initial_delay, initial_delay * factor, ...` between consecutive attempts.
//! Each call owns its own attempt counter, so the executor is reentrant.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first). Zero behaves as one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(rename = "initial_delay_ms", with = "duration_millis", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after every retry
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryPolicy {
    /// Same delay between every attempt.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff_factor: 1.0,
        }
    }

    /// Run the operation exactly once.
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor).unwrap_or(delay)
    }
}

/// Passed to the retry hook after a failed attempt that will be retried.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// 1-based number of the attempt that just failed
    pub attempt_number: u32,

    /// How long the executor will sleep before the next attempt
    pub delay: Duration,

    /// The failure of this attempt
    pub last_error: &'a E,
}

/// Run `operation` until it succeeds or the policy's attempts are used up.
///
/// On exhaustion the error of the final attempt is returned as-is.
pub async fn execute_with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    execute_with_retry_notify(policy, operation, |_| {}).await
}

/// Like [`execute_with_retry`], calling `on_retry` before every backoff sleep.
pub async fn execute_with_retry_notify<T, E, F, Fut, H>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: H,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    H: FnMut(RetryAttempt<'_, E>),
{
    let max_attempts = policy.attempts();
    let mut delay = policy.initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }
                on_retry(RetryAttempt {
                    attempt_number: attempt,
                    delay,
                    last_error: &err,
                });
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
