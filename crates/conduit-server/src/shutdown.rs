//! Graceful shutdown of the gateway's background tasks.
//!
//! Every periodic task (heartbeat sweep, stream sweep, sample purge, alert
//! loop, broker listener) is spawned through the coordinator and watches its
//! token. Shutdown cancels the token and waits for the tasks to finish.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default timeout for graceful shutdown before giving up on stragglers.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates graceful shutdown across all gateway tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a named task that shutdown will wait for.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "background task started");
        self.tasks.lock().push((name, tokio::spawn(task)));
    }

    /// Track an already spawned task.
    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    /// Number of tracked tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token and wait up to `timeout` for every tracked task.
    ///
    /// Tasks still running after the timeout are aborted.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let tasks = std::mem::take(&mut *self.tasks.lock());

        self.shutdown();
        info!(
            task_count = tasks.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let (names, handles): (Vec<&'static str>, Vec<JoinHandle<()>>) = tasks.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);

        match tokio::time::timeout(timeout, drain).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(task = name, error = %e, "task ended abnormally");
                    }
                }
            }
            Err(_) => {
                warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
                for handle in aborts {
                    handle.abort();
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn shutdown_propagates_to_tokens() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled() && t2.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_awaits_spawned_tasks() {
        let coord = ShutdownCoordinator::new();
        let finished = Arc::new(AtomicBool::new(false));
        let token = coord.token();
        let flag = finished.clone();
        coord.spawn("sweep", async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(coord.task_count(), 1);

        coord.graceful_shutdown(None).await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(coord.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_times_out_and_aborts() {
        let coord = ShutdownCoordinator::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let abort = handle.abort_handle();
        coord.track("stuck", handle);

        coord.graceful_shutdown(Some(Duration::from_millis(100))).await;
        for _ in 0..10 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }

    #[tokio::test]
    async fn empty_shutdown_completes() {
        let coord = ShutdownCoordinator::default();
        coord.graceful_shutdown(Some(Duration::from_secs(1))).await;
        assert!(coord.is_shutting_down());
    }
}
