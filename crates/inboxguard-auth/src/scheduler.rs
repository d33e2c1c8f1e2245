//! A background task that runs a callback at a fixed interval.
//!
//! [`RecurringTask`] owns one tokio task. Stopping it flips the running flag,
//! wakes the sleeping loop and waits for the task to finish, so a tick that
//! is already executing completes before `stop` returns.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub struct RecurringTask {
    name: String,
    interval: Duration,
    /// Flag to signal the background loop to stop.
    running: Arc<AtomicBool>,
    /// Wakes the loop out of its sleep on stop.
    shutdown: Arc<Notify>,
    /// Handle to the background tokio task.
    handle: Option<JoinHandle<()>>,
}

impl RecurringTask {
    /// Spawn the loop. With `run_immediately` the first tick fires at once,
    /// otherwise after one `interval`.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        run_immediately: bool,
        tick: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let task_name = name.clone();
        let task_running = Arc::clone(&running);
        let task_shutdown = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            tracing::info!(task = %task_name, interval_secs = interval.as_secs(), "recurring task started");

            let start = if run_immediately {
                Instant::now()
            } else {
                Instant::now() + interval
            };
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while task_running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !task_running.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::debug!(task = %task_name, "recurring task tick");
                        tick().await;
                    }
                    _ = task_shutdown.notified() => {}
                }
            }

            tracing::info!(task = %task_name, "recurring task stopped");
        });

        Self {
            name,
            interval,
            running,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check whether the background loop is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to finish.
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!(task = %self.name, "stop called but task is not running");
            return;
        }
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::error!(task = %self.name, error = %e, "recurring task panicked during shutdown");
        }
    }
}

impl Drop for RecurringTask {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
