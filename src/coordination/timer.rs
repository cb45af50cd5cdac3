//! Cancellable waits and delayed job submission.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Returns `true` if the full duration elapsed, `false` if cancelled.
pub async fn sleep_cancellable(duration: Duration, token: &CancellationToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Owns delayed jobs: each submitted job waits for its deadline, then runs.
///
/// Cancelling the timer drops every job still waiting. Jobs already running
/// are allowed to finish.
pub struct DelayTimer {
    token: CancellationToken,
    tracker: TaskTracker,
    waiting: Arc<AtomicUsize>,
}

impl DelayTimer {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// A timer cancelled together with `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `job` after `delay`. A zero delay runs it on the next poll.
    pub fn submit_after<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_at(Instant::now() + delay, job);
    }

    /// Run `job` at `deadline` (immediately if it has passed).
    ///
    /// A job whose deadline and cancellation are both ready never runs.
    pub fn submit_at<F>(&self, deadline: Instant, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let waiting = Arc::clone(&self.waiting);
        waiting.fetch_add(1, Ordering::SeqCst);

        self.tracker.spawn(async move {
            let fire = tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = tokio::time::sleep_until(deadline) => true,
            };
            waiting.fetch_sub(1, Ordering::SeqCst);
            if fire {
                job.await;
            }
        });
    }

    /// Jobs still waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Jobs waiting or running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Drop every waiting job.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until every submitted job has fired (or been cancelled) and finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl Default for DelayTimer {
    fn default() -> Self {
        Self::new()
    }
}
