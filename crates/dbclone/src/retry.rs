//! Fixed-backoff retry for operations that may fail transiently.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{CloneError, Result};

/// How many times an operation may run and how long to wait between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never below 1.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// A single attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are spent. The last error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: Option<&CancellationToken>,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_when(label, cancel, CloneError::is_retryable, op).await
    }

    /// Like [`run`](Self::run), retrying only errors accepted by `retryable`.
    ///
    /// A cancelled token ends the backoff early with [`CloneError::Cancelled`].
    pub async fn run_when<T, F, Fut, P>(
        &self,
        label: &str,
        cancel: Option<&CancellationToken>,
        retryable: P,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&CloneError) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && retryable(&e) => {
                    warn!(
                        operation = label,
                        attempt,
                        attempts,
                        "Retrying after {:?}: {}",
                        self.backoff,
                        e
                    );
                    match cancel {
                        Some(token) => tokio::select! {
                            _ = token.cancelled() => return Err(CloneError::Cancelled),
                            _ = tokio::time::sleep(self.backoff) => {}
                        },
                        None => tokio::time::sleep(self.backoff).await,
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
