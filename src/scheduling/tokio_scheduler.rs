//! Tokio-backed scheduler.

use super::{ScheduledWork, SchedulerError, TaskScheduler};
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::trace;

/// Spawns block work onto a Tokio runtime
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Bind to the runtime the caller is running on
    pub fn current() -> Result<Self, SchedulerError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| SchedulerError::RuntimeUnavailable(e.to_string()))
    }

    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule(&self, work: ScheduledWork) -> Result<(), SchedulerError> {
        trace!("⏱️ SCHEDULER: spawning block work");
        self.handle.spawn(async move { work() });
        Ok(())
    }

    fn schedule_future(&self, work: BoxFuture<'static, ()>) -> Result<(), SchedulerError> {
        self.handle.spawn(work);
        Ok(())
    }
}
