//! Background maintenance tasks wired into the scheduler.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::Shared;
use crate::error::Result;
use crate::scheduler::BackgroundTask;

/// Long-lived periodic compaction driver. The merge pass itself is a
/// placeholder; the task maintains the in-progress flag and the cadence.
pub(crate) struct CompactionTask {
    shared: Arc<Shared>,
    interval: Duration,
}

impl CompactionTask {
    pub(crate) fn new(shared: Arc<Shared>, interval: Duration) -> Self {
        Self { shared, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        self.shared.compact();
        Ok(())
    }
}
