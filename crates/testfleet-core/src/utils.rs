/*!
 * Utility functions and helpers for TestFleet.
 *
 * Every device wait in the fleet is a bounded poll: check a predicate,
 * sleep one interval, repeat until the deadline. The helpers here keep
 * that loop in one place.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Poll a check until it yields a value or the timeout elapses
///
/// The check runs at least once, even with a zero timeout. Between two
/// checks the loop sleeps `interval`, clipped to the remaining budget.
///
/// # Returns
///
/// The first `Some` produced by `check`, or `None` once the deadline passed
pub async fn poll_until<F, Fut, T>(
    interval: Duration,
    duration: Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + duration;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = check().await {
            trace!("Poll satisfied after {} attempts", attempts);
            return Some(value);
        }

        let now = Instant::now();
        if now >= deadline {
            debug!("Poll gave up after {} attempts ({:?})", attempts, duration);
            return None;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Like [`poll_until`] for checks that only answer yes or no
pub async fn poll_until_true<F, Fut>(interval: Duration, duration: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    poll_until(interval, duration, || {
        let fut = check();
        async move { fut.await.then_some(()) }
    })
    .await
    .is_some()
}

/// Time left until `deadline`, zero once it passed
pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Sleep for `duration` unless the token is cancelled first
///
/// # Returns
///
/// `true` if the full duration elapsed, `false` if cancelled
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Spawn a background task and log how it ended
///
/// Failures are logged at warn level and never propagate to the spawner.
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => debug!("Task {} finished", task_name),
            Err(e) => warn!("Task {} ended early: {}", task_name, e),
        }
    })
}
