//! Exponential backoff for remote requests.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::RemoteError;

/// Retry configuration for remote requests.
///
/// Only [`RemoteError::TransientNetwork`] failures are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between retries.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// No retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// The delay following `delay`, capped at `max_delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        std::cmp::min(
            Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier),
            self.max_delay,
        )
    }
}

/// Runs `operation` until it succeeds, fails permanently, or runs out of
/// retries.
///
/// Cancelling `cancel` interrupts a backoff sleep; the last error is then
/// returned without another attempt.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::debug!(attempts, "Request succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() || attempts > config.max_retries => return Err(e),
            Err(e) => {
                tracing::warn!(
                    attempt = attempts,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Request failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Serde module for Duration with humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_next_delay_is_capped() {
        let config = fast();
        assert_eq!(config.next_delay(Duration::from_millis(10)), Duration::from_millis(20));
        assert_eq!(config.next_delay(Duration::from_millis(30)), Duration::from_millis(40));
    }

    #[test]
    fn test_humantime_round_trip() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"initial_delay": "250ms", "max_delay": "1m"}"#).unwrap();
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.max_retries, 3);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["initial_delay"], "250ms");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(&fast(), &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::transient("reset"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&fast(), &CancellationToken::new(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::transient("down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&fast(), &CancellationToken::new(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::rejected(Some(400), "bad")) }
        })
        .await;
        assert_eq!(result, Err(RemoteError::rejected(Some(400), "bad")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = RetryConfig {
            initial_delay: Duration::from_secs(3600),
            ..fast()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&config, &cancel, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::transient("down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
