//! Fixed-interval polling with a deadline.
//!
//! Every readiness check in the crate (SSH reachability, node readiness,
//! etcd/kubelet service state, add-on rollout, cluster health) is a
//! [`wait_until`] call with a different condition.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Default interval between polling attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Interval and deadline for a single wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Delay between attempts.
    pub interval: Duration,
    /// Total time budget.
    pub timeout: Duration,
}

impl WaitOptions {
    /// Wait up to `timeout` with the default interval.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout,
        }
    }

    /// Override the polling interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Poll `condition` until it reports done, the timeout elapses, or `cancel`
/// fires.
///
/// The condition returns `Ok(true)` when done and `Ok(false)` when not yet.
/// An `Err` is recorded as the last observed error and the loop keeps going;
/// only [`Error::Cancelled`] short-circuits. The first attempt runs
/// immediately.
///
/// # Errors
///
/// Returns [`Error::Timeout`] (carrying the last observed error) once the
/// deadline passes, or [`Error::Cancelled`] when the token is cancelled.
pub async fn wait_until<F, Fut>(
    what: &str,
    options: WaitOptions,
    cancel: &CancellationToken,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let mut last_error: Option<String> = None;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(what.to_string()));
        }

        attempt += 1;
        match condition().await {
            Ok(true) => {
                debug!(what, attempt, "Condition met");
                return Ok(());
            }
            Ok(false) => {
                debug!(what, attempt, "Condition not met yet");
            }
            Err(Error::Cancelled(inner)) => return Err(Error::Cancelled(inner)),
            Err(e) => {
                debug!(what, attempt, error = %e, "Condition check failed");
                last_error = Some(e.to_string());
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= options.timeout {
            return Err(Error::Timeout {
                what: what.to_string(),
                elapsed,
                last_error,
            });
        }

        // Never sleep past the deadline so the final check lands on it.
        let pause = options.interval.min(options.timeout - elapsed);
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled(what.to_string())),
            () = tokio::time::sleep(pause) => {}
        }
    }
}
