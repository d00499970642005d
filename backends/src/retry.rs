//! Retrying of transient backend failures.

use blocksnap_core::Error;
use rand::Rng;
use std::future::Future;
use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently a backend operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Sleep a random fraction of the computed delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reads()
    }
}

impl RetryPolicy {
    pub fn reads() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
            jitter: true,
        }
    }

    /// Block writes are what a backup waits on; they get the longest budget.
    pub fn writes() -> Self {
        Self {
            attempts: 8,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Failed deletes are reported to cleanup, which tries again on its next run.
    pub fn deletes() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (0-based): the base delay doubled
    /// per retry, capped at `max_delay`.
    pub fn delay(&self, retry: u32) -> Duration {
        let cap = self
            .base_delay
            .checked_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));
        if self.jitter && !cap.is_zero() {
            let millis = cap.as_millis().min(u64::MAX as u128) as u64;
            Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
        } else {
            cap
        }
    }
}

/// Errors that may go away when the operation is repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "throttl",
    "slowdown",
    "slow down",
    "rate limit",
    "try again",
    "temporarily unavailable",
    "dispatch failure",
    "connection reset",
    "internalerror",
    "503",
    "500",
    "429",
];

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                IoErrorKind::Interrupted
                    | IoErrorKind::TimedOut
                    | IoErrorKind::WouldBlock
                    | IoErrorKind::ConnectionReset
                    | IoErrorKind::ConnectionAborted
                    | IoErrorKind::BrokenPipe
            ),
            // Services only tell transient conditions apart in the message.
            Error::Backend(message) => {
                let message = message.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
            }
            _ => false,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error or
/// the policy's attempts are used up. `what` and `key` only feed the logs.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, what: &str, key: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut retry = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(operation = what, key, retries = retry, "Backend operation recovered");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_retryable() || retry + 1 >= attempts {
            if error.is_retryable() {
                warn!(operation = what, key, attempts, "Giving up on backend operation: {}", error);
            }
            return Err(error);
        }

        let delay = policy.delay(retry);
        warn!(
            operation = what,
            key,
            attempt = retry + 1,
            attempts,
            delay_ms = delay.as_millis() as u64,
            "Backend operation failed, retrying: {}",
            error
        );
        tokio::time::sleep(delay).await;
        retry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: false,
        }
    }

    fn timeout() -> Error {
        Error::Io(std::io::Error::new(IoErrorKind::TimedOut, "slow disk"))
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = retry_with_backoff(&fast(5), "read", "blocks/a", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(timeout())
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_with_backoff(&fast(3), "write", "blocks/a", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Backend("503 Service Unavailable".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_with_backoff(&fast(5), "read", "blocks/a", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::not_found("blob", "blocks/a"))
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_classification() {
        assert!(timeout().is_retryable());
        assert!(!Error::Io(std::io::Error::new(IoErrorKind::PermissionDenied, "no")).is_retryable());
        assert!(Error::Backend("SlowDown: reduce your request rate".to_string()).is_retryable());
        assert!(!Error::Backend("AccessDenied".to_string()).is_retryable());
        assert!(!Error::Corrupt("checksum mismatch".to_string()).is_retryable());
    }

    #[test]
    fn test_delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));

        let jittered = RetryPolicy { jitter: true, ..policy };
        for retry in 0..6 {
            let delay = jittered.delay(retry);
            assert!(delay >= policy.delay(retry) / 2 && delay <= policy.delay(retry));
        }
    }
}
