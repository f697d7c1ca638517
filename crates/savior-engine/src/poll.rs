//! Fixed-interval polling used at every suspension point of a job.

use savior_common::{Result, SaviorError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Poll configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval: Duration,
    /// `None` retries forever. Bounding a job is then the operator's concern.
    pub timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run `check` until it yields `Some`, sleeping `interval` between attempts.
    ///
    /// The first check runs immediately. Errors from `check` end the wait at
    /// once; only "not yet" (`Ok(None)`) is retried.
    pub async fn until<T, F, Fut>(&self, what: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if let Some(value) = check().await? {
                debug!(what, attempts, "Poll condition met");
                return Ok(value);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SaviorError::Timeout(what.to_string()));
                }
            }

            trace!(what, attempts, "Condition not met yet, sleeping");
            sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_until_returns_first_ready_value() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let poll = PollConfig::new(Duration::from_millis(1));

        let value = poll
            .until("counter", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n >= 3).then_some(n))
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_until_times_out() {
        let poll =
            PollConfig::new(Duration::from_millis(5)).with_timeout(Duration::from_millis(20));

        let err = poll
            .until("never", || async { Ok(None::<()>) })
            .await
            .unwrap_err();

        assert!(matches!(err, SaviorError::Timeout(what) if what == "never"));
    }

    #[tokio::test]
    async fn test_until_propagates_errors() {
        let poll = PollConfig::new(Duration::from_millis(1));

        let err = poll
            .until("broken", || async {
                Err::<Option<()>, _>(SaviorError::Platform("gone".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SaviorError::Platform(_)));
    }
}
