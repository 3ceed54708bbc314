//! Retry logic with exponential backoff and jitter

use crate::config::Config;
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            jitter: 0.25,
        }
    }
}

impl From<&Config> for RetryConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_delay_ms,
            ..Default::default()
        }
    }
}

/// Execute an async operation with retry logic
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                last_error = Some(e);

                if attempt < config.max_retries {
                    let delay = backoff_delay(config, attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = config.max_retries,
                        delay_ms = delay.as_millis(),
                        "Operation failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::network("max retries exceeded")))
}

/// Delay before retry number `attempt` (0-based): exponential, capped, with jitter
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponential = config
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = std::cmp::min(exponential, config.max_delay_ms);

    let jitter_range = (capped as f64 * config.jitter) as u64;
    let jitter = if jitter_range > 0 {
        rand_jitter(jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped.saturating_add(jitter))
}

/// Generate random jitter from the clock's sub-second noise
fn rand_jitter(max: u64) -> u64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos % max
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&config, 5), Duration::from_millis(30000));
        assert_eq!(backoff_delay(&config, 80), Duration::from_millis(30000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: 0.5,
            ..Default::default()
        };
        let delay = backoff_delay(&config, 0);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        };
        let calls = AtomicU32::new(0);

        let result = with_retry(&config, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::network("flaky"))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_permanent_error() {
        let config = RetryConfig {
            base_delay_ms: 1,
            jitter: 0.0,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::proof("rejected"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
