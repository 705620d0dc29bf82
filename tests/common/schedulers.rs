//! Schedulers for exercising block work deterministically or failing it.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tasker_dataflow::scheduling::{ScheduledWork, SchedulerError};
use tasker_dataflow::TaskScheduler;

/// Rejects every submission
#[derive(Debug, Default)]
pub struct RejectingScheduler;

impl TaskScheduler for RejectingScheduler {
    fn schedule(&self, _work: ScheduledWork) -> Result<(), SchedulerError> {
        Err(SchedulerError::Rejected("test scheduler rejects work".to_string()))
    }

    fn schedule_future(&self, _work: BoxFuture<'static, ()>) -> Result<(), SchedulerError> {
        Err(SchedulerError::Rejected("test scheduler rejects work".to_string()))
    }
}

/// Queues synchronous work until the test runs it. Futures go to tokio.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<ScheduledWork>>,
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.queue.lock().len())
            .finish()
    }
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run exactly one queued item
    pub fn run_one(&self) -> bool {
        let work = self.queue.lock().pop_front();
        match work {
            Some(work) => {
                work();
                true
            }
            None => false,
        }
    }

    /// Run until nothing is queued, including work queued by work
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl TaskScheduler for ManualScheduler {
    fn schedule(&self, work: ScheduledWork) -> Result<(), SchedulerError> {
        self.queue.lock().push_back(work);
        Ok(())
    }

    fn schedule_future(&self, work: BoxFuture<'static, ()>) -> Result<(), SchedulerError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| SchedulerError::RuntimeUnavailable(e.to_string()))?;
        handle.spawn(work);
        Ok(())
    }
}
