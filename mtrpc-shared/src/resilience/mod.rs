//! The retry wrapper that guards Manager/Responder broker I/O (spec.md
//! §4.4, §5).
//!
//! Shaped after the teacher's circuit-breaker module
//! (`tasker_shared::resilience`): a small `Behavior`-flavored trait plus a
//! metrics snapshot struct, but specialized to the spec's retry-and-reconnect
//! contract rather than a trip/half-open/closed state machine — this core
//! does not need circuit breaking, only "retry the action, and if it keeps
//! failing, tear down and re-establish the connection, bounded attempts on
//! both loops".

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Attempt/interval bounds for one actor's retry wrapper. `0` in either
/// attempts field means unbounded, per spec.md §5.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts at the guarded action itself before giving up.
    pub try_action_attempts: u32,
    /// Delay between action attempts (and between connect attempts).
    pub reconnect_interval: Duration,
    /// Attempts at re-establishing the connection, per action-attempt.
    pub connect_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            try_action_attempts: 3,
            reconnect_interval: Duration::from_millis(1000),
            connect_attempts: 3,
        }
    }
}

/// Running counters for one retry wrapper instance, for health reporting.
#[derive(Debug, Default)]
pub struct RetryMetrics {
    pub attempts: AtomicU64,
    pub failures: AtomicU64,
    pub reconnects: AtomicU64,
}

impl RetryMetrics {
    pub fn snapshot(&self) -> RetryMetricsSnapshot {
        RetryMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMetricsSnapshot {
    pub attempts: u64,
    pub failures: u64,
    pub reconnects: u64,
}

/// Re-establish a connection up to `policy.connect_attempts` times
/// (0 = unbounded), sleeping `reconnect_interval` between attempts.
pub async fn connect_with_retry<T, E, Fut>(
    policy: &RetryPolicy,
    metrics: &RetryMetrics,
    mut connect: impl FnMut() -> Fut,
) -> Result<T, ServerError>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match connect().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                metrics.failures.fetch_add(1, Ordering::Relaxed);
                if policy.connect_attempts != 0 && attempt >= policy.connect_attempts {
                    return Err(ServerError::Amqp {
                        attempts: attempt,
                        detail: e.to_string(),
                    });
                }
                tracing::warn!(
                    attempt,
                    error = %e,
                    "broker connect attempt failed, retrying"
                );
                tokio::time::sleep(policy.reconnect_interval).await;
            }
        }
    }
}

/// Guard one broker action with the retry-and-reconnect contract: on
/// failure, sleep, invoke `reconnect`, and try the action again, up to
/// `policy.try_action_attempts` times (0 = unbounded). `StoppingException`
/// in spec.md terms is never routed through here — callers check the
/// control-plane stopping descriptor *before* calling `retry_action`, so a
/// cooperative shutdown never gets masked as a transient failure (spec.md
/// §5).
pub async fn retry_action<T, E, ActionFut, ReconnectFut>(
    policy: &RetryPolicy,
    metrics: &RetryMetrics,
    mut action: impl FnMut() -> ActionFut,
    mut reconnect: impl FnMut() -> ReconnectFut,
) -> Result<T, ServerError>
where
    ActionFut: Future<Output = Result<T, E>>,
    ReconnectFut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        metrics.attempts.fetch_add(1, Ordering::Relaxed);
        match action().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                metrics.failures.fetch_add(1, Ordering::Relaxed);
                if policy.try_action_attempts != 0 && attempt >= policy.try_action_attempts {
                    return Err(ServerError::Amqp {
                        attempts: attempt,
                        detail: e.to_string(),
                    });
                }
                tracing::warn!(
                    attempt,
                    error = %e,
                    "broker action failed, reconnecting before retry"
                );
                tokio::time::sleep(policy.reconnect_interval).await;
                metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                if let Err(reconnect_err) = reconnect().await {
                    tracing::warn!(error = %reconnect_err, "reconnect attempt failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn retry_action_succeeds_without_retry() {
        let policy = RetryPolicy {
            try_action_attempts: 3,
            reconnect_interval: Duration::from_millis(1),
            connect_attempts: 3,
        };
        let metrics = RetryMetrics::default();
        let result: Result<u32, ServerError> = retry_action(
            &policy,
            &metrics,
            || async { Ok::<u32, String>(42) },
            || async { Ok::<(), String>(()) },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(metrics.snapshot().attempts, 1);
        assert_eq!(metrics.snapshot().failures, 0);
    }

    #[tokio::test]
    async fn retry_action_recovers_after_transient_failure() {
        let policy = RetryPolicy {
            try_action_attempts: 3,
            reconnect_interval: Duration::from_millis(1),
            connect_attempts: 3,
        };
        let metrics = RetryMetrics::default();
        let calls = AtomicU32::new(0);
        let result: Result<u32, ServerError> = retry_action(
            &policy,
            &metrics,
            || {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if n == 0 {
                        Err::<u32, String>("transient".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
            || async { Ok::<(), String>(()) },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(metrics.snapshot().attempts, 2);
        assert_eq!(metrics.snapshot().failures, 1);
        assert_eq!(metrics.snapshot().reconnects, 1);
    }

    #[tokio::test]
    async fn retry_action_surfaces_amqp_error_after_exhausting_attempts() {
        let policy = RetryPolicy {
            try_action_attempts: 2,
            reconnect_interval: Duration::from_millis(1),
            connect_attempts: 1,
        };
        let metrics = RetryMetrics::default();
        let result: Result<u32, ServerError> = retry_action(
            &policy,
            &metrics,
            || async { Err::<u32, String>("down".to_string()) },
            || async { Ok::<(), String>(()) },
        )
        .await;
        match result.unwrap_err() {
            ServerError::Amqp { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected Amqp error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_attempts_means_unbounded_until_success() {
        let policy = RetryPolicy {
            try_action_attempts: 0,
            reconnect_interval: Duration::from_millis(1),
            connect_attempts: 0,
        };
        let metrics = RetryMetrics::default();
        let calls = AtomicU32::new(0);
        let result: Result<u32, ServerError> = retry_action(
            &policy,
            &metrics,
            || {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if n < 5 {
                        Err::<u32, String>("still down".to_string())
                    } else {
                        Ok(1)
                    }
                }
            },
            || async { Ok::<(), String>(()) },
        )
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(metrics.snapshot().failures, 5);
    }
}
