//! Wait-for-success helper
//!
//! Opt-in polling for backend operations that are expected to succeed
//! eventually (e.g. deleting an image whose watchers are still going away).
//! The check is retried at a fixed interval until it succeeds or the timeout
//! elapses.

use crate::error::{Error, Result};
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default pause between attempts
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Default overall deadline
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Polling schedule for [`wait_for_success`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_WAIT_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl WaitPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Constant-interval schedule bounded by the timeout
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.interval,
            initial_interval: self.interval,
            randomization_factor: 0.0,
            multiplier: 1.0,
            max_interval: self.interval,
            max_elapsed_time: Some(self.timeout),
            ..ExponentialBackoff::default()
        }
    }
}

/// Poll `check` until it succeeds. On timeout the last failure is wrapped in
/// `Error::Timeout` together with `message`.
pub async fn wait_for_success<T, F, Fut>(message: &str, policy: &WaitPolicy, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let outcome = backoff::future::retry(policy.schedule(), || {
        let attempt = check();
        async move {
            attempt.await.map_err(|e| {
                debug!("{}. Re-trying.", e);
                backoff::Error::transient(e)
            })
        }
    })
    .await;

    outcome.map_err(|e| Error::Timeout {
        operation: message.to_string(),
        timeout: policy.timeout,
        source: Box::new(e),
    })
}
