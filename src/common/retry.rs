//! Retry with exponential backoff for transient RPC failures

use crate::common::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff parameters. `max_attempts = None` retries forever, which is what the
/// coordinator uses: a transient failure never changes the protocol outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(
        default = "default_initial_backoff",
        deserialize_with = "crate::common::utils::deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub initial_backoff: Duration,

    #[serde(
        default = "default_max_backoff",
        deserialize_with = "crate::common::utils::deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_backoff: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay added as random jitter (0.0 disables)
    #[serde(default)]
    pub jitter: f64,

    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}
fn default_multiplier() -> f64 {
    2.0
}

fn serialize_duration<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&format!("{}ms", d.as_millis()))
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Tight policy for tests and in-process clusters
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.multiplier.powi(attempt.min(31) as i32);
        let delay = self.initial_backoff.as_secs_f64() * multiplier;
        let capped = delay.min(self.max_backoff.as_secs_f64());
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter) * capped
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }

    /// Run `op` until it succeeds or fails with a non-retryable error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if self.max_attempts.is_some_and(|max| attempt + 1 >= max) {
                        tracing::warn!(op = what, attempt, error = %e, "giving up after retries");
                        return Err(e);
                    }
                    let delay = self.backoff_delay(attempt);
                    tracing::debug!(op = what, attempt, ?delay, error = %e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delay_exponential_and_capped() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: None,
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate()
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(Error::Transient("unavailable".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::immediate()
            .run("conflict", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::VersionConflict("stale".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::VersionConflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_attempts_bounds_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::immediate()
        };
        let result: Result<()> = policy
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout("slow".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
