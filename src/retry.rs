use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::EtlError;

const MAX_BACKOFF_CAP: Duration = Duration::from_secs(150);

/// Retry knob carried by every task. `retries = 0` means a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub retries: u32,
    #[serde(with = "secs")]
    pub interval: Duration,
    #[serde(with = "secs")]
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Outcome of the last attempt plus how many attempts were made.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, EtlError>,
    pub attempts: u32,
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: Option<RetryPolicy>) -> Self {
        let mut policy = policy.unwrap_or_default();

        if policy.interval.is_zero() {
            policy.interval = Duration::from_secs(1);
        }
        if policy.max_interval.is_zero() {
            policy.max_interval = Duration::from_secs(30);
        }
        if policy.multiplier <= 0.0 {
            policy.multiplier = 2.0;
        }
        if policy.max_interval > MAX_BACKOFF_CAP {
            policy.max_interval = MAX_BACKOFF_CAP;
        }

        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds or the policy is exhausted. The
    /// error of the last attempt is returned unchanged so callers can still
    /// tell a timeout from a failure.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        ctx: CancellationToken,
        task_name: &str,
        mut operation: F,
    ) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EtlError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            if ctx.is_cancelled() {
                return Attempted {
                    result: Err(EtlError::ContextCancelled(format!(
                        "cancelled before attempt {attempt} of {task_name}"
                    ))),
                    attempts: attempt - 1,
                };
            }

            let result = operation(attempt).await;
            let err = match result {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            let wait_time = self.calculate_backoff(attempt);
            warn!(
                task = task_name,
                attempt,
                max_attempts,
                backoff_ms = wait_time.as_millis() as u64,
                error = %err,
                "task attempt failed, retrying"
            );

            tokio::select! {
                _ = ctx.cancelled() => {
                    return Attempted {
                        result: Err(EtlError::ContextCancelled(
                            "Context cancelled during retry wait".to_string(),
                        )),
                        attempts: attempt,
                    };
                }
                _ = sleep(wait_time) => {}
            }

            attempt += 1;
        }
    }

    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff = self.policy.interval.as_secs_f64() * self.policy.multiplier.powi(exponent);

        if !backoff.is_finite() || backoff >= self.policy.max_interval.as_secs_f64() {
            self.policy.max_interval
        } else {
            Duration::from_secs_f64(backoff)
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
