//! Bounded fixed-delay retry for kernel-table mutations.
//!
//! IPVS writes can transiently fail (netlink buffer pressure, concurrent
//! administration tools), so every mutation the reconciliation engine issues
//! goes through a small fixed-delay retry. The delay is deliberately not
//! exponential: the operations are cheap and the bound is tight.

use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How many times to attempt an operation and how long to wait between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Default policy for ensure-style operations (virtual/real server
    /// creation outside the probe loop).
    pub const ENSURE: RetryPolicy = RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(100),
    };

    /// Default policy for probe-driven mutations (weight changes, removal,
    /// re-addition during a probe pass).
    pub const PROBE: RetryPolicy = RetryPolicy {
        attempts: 2,
        delay: Duration::from_millis(50),
    };

    pub const fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy { attempts, delay }
    }
}

/// Run `op` until it succeeds or the policy's attempt budget is exhausted.
///
/// Returns the first success, or the error from the final attempt.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(attempt, error = %e, "operation failed, retrying");
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry(RetryPolicy::new(3, Duration::from_millis(1)), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(RetryPolicy::new(3, Duration::from_millis(1)), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::ipvs("transient"))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(RetryPolicy::new(2, Duration::from_millis(1)), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::ipvs("persistent")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let result = retry(RetryPolicy::new(0, Duration::from_millis(1)), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
