//! Periodic and one-off background task execution.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// A named task the scheduler drives at a fixed interval.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self) -> Result<()>;
}

/// Drives registered periodic tasks and fire-and-forget jobs, with
/// broadcast-based shutdown.
pub struct Scheduler {
    handles: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            handles: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Registers a periodic task. Must be called within a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.execute().await {
                            tracing::error!(task = task.name(), error = %e, "background task failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "task shutting down");
                        break;
                    }
                }
            }
        });
        self.handles.write().unwrap().push(handle);
    }

    /// Spawns a one-off task; failures are logged, never propagated.
    pub fn spawn<F>(&self, f: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = f.await {
                tracing::warn!(error = %e, "one-off task failed");
            }
        });
    }

    /// Signals every registered task to stop without waiting for it.
    pub fn stop(&self) {
        self.shutdown_tx.send(()).ok();
    }

    /// Signals shutdown and waits for all registered tasks to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop();
        let handles: Vec<_> = self.handles.write().unwrap().drain(..).collect();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
