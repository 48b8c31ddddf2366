use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::errors::{KaminoError, KaminoResult};

/// Backoff and wall-clock budget for one wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    /// Interval doubles after every unsuccessful check, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration, timeout: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            timeout,
        }
    }

    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            timeout,
        }
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Runs `check` until it yields a value or the policy's budget is spent.
///
/// `Ok(None)` means "not yet". Errors from `check` are treated as transient:
/// they are logged and the loop keeps going.
pub async fn poll_until<T, F, Fut>(policy: PollPolicy, what: &str, mut check: F) -> KaminoResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KaminoResult<Option<T>>>,
{
    let started = Instant::now();
    let mut delay = policy.initial;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match check().await {
            Ok(Some(value)) => {
                debug!(what, attempt, "condition met");
                return Ok(value);
            }
            Ok(None) => debug!(what, attempt, next_check_ms = delay.as_millis() as u64, "not ready"),
            Err(e) => warn!(what, attempt, error = %e, "poll attempt failed, retrying"),
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(KaminoError::timeout(what, elapsed));
        }
        sleep(delay.min(policy.timeout - elapsed)).await;
        delay = policy.next_delay(delay);
    }
}

/// Like [`poll_until`], but runs `compensate` when the budget runs out.
/// A failing compensation is folded into the returned timeout error.
pub async fn poll_until_or_compensate<T, F, Fut, C, CFut>(
    policy: PollPolicy,
    what: &str,
    check: F,
    compensate: C,
) -> KaminoResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KaminoResult<Option<T>>>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = KaminoResult<()>>,
{
    match poll_until(policy, what, check).await {
        Err(KaminoError::Timeout { what, elapsed, .. }) => {
            warn!(what = %what, "wait timed out, running cleanup");
            let cleanup = compensate().await.err().map(|e| e.to_string());
            Err(KaminoError::Timeout {
                what,
                elapsed,
                cleanup,
            })
        }
        other => other,
    }
}
