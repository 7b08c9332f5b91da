//! Bounded retry with fault classification.
//!
//! One [`RetryPolicy`] instance is shared by the paginator (around every
//! remote call) and consulted by the status controller (to decide whether a
//! failed run defers or ends). Only transient faults are retried; permanent
//! ones propagate on the first attempt. Exhausting the budget yields a typed
//! [`SyncError::UpstreamUnavailable`] rather than the raw last error, so the
//! controller can recognize the deferred-retry path without string matching.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use groupsync_common::SyncError;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles after each failed attempt.
    #[default]
    Exponential,
}

impl std::str::FromStr for Backoff {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(Backoff::Fixed),
            "exponential" => Ok(Backoff::Exponential),
            _ => anyhow::bail!("Invalid backoff mode '{}'. Valid values: fixed, exponential", s),
        }
    }
}

/// Bounded retry schedule applied to transient faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; a budget of 3 allows 4 calls.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff,
        }
    }

    /// Delay before retrying after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1)),
        }
    }

    /// Run `op`, retrying transient faults up to the retry budget.
    ///
    /// Permanent faults return immediately. A budget exhausted on transient
    /// faults returns [`SyncError::UpstreamUnavailable`] carrying the attempt
    /// count and the last underlying failure.
    pub async fn execute<T, F, Fut>(&self, what: &str, op: F) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        let attempts = self.max_retries + 1;
        let mut last: Option<SyncError> = None;

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    warn!(what, attempt, attempts, error = %err, "transient fault");
                    if attempt < attempts {
                        tokio::time::sleep(self.delay_for(attempt)).await;
                    }
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(SyncError::UpstreamUnavailable {
            attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Budget of 3 retries: up to 4 calls per operation.
    fn quick() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Backoff::Fixed)
    }

    #[test]
    fn test_delay_schedule() {
        let fixed = RetryPolicy::new(3, Duration::from_millis(100), Backoff::Fixed);
        assert_eq!(fixed.delay_for(1), Duration::from_millis(100));
        assert_eq!(fixed.delay_for(3), Duration::from_millis(100));

        let exp = RetryPolicy::new(4, Duration::from_millis(100), Backoff::Exponential);
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(2), Duration::from_millis(200));
        assert_eq!(exp.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_from_str() {
        assert_eq!("fixed".parse::<Backoff>().unwrap(), Backoff::Fixed);
        assert_eq!(
            "Exponential".parse::<Backoff>().unwrap(),
            Backoff::Exponential
        );
        assert!("jitter".parse::<Backoff>().is_err());
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = quick()
            .execute("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SyncError>(7)
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_three_faults_still_succeed() {
        let calls = AtomicU32::new(0);
        let result = quick()
            .execute("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(SyncError::Timeout {
                            what: "op".into(),
                            millis: 1,
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_yields_typed_failure() {
        let calls = AtomicU32::new(0);
        let err = quick()
            .execute("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(SyncError::Connection("reset".into()))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            SyncError::UpstreamUnavailable { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(last.contains("reset"));
            }
            other => panic!("Expected UpstreamUnavailable, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_fault_not_retried() {
        let calls = AtomicU32::new(0);
        let err = quick()
            .execute("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(SyncError::UpstreamHttp {
                        status: 400,
                        message: "bad token".into(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, SyncError::UpstreamHttp { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_server_errors_consume_budget() {
        let calls = AtomicU32::new(0);
        let err = quick()
            .execute("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(SyncError::UpstreamHttp {
                        status: 502,
                        message: "bad gateway".into(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.is_transient());
    }
}
