//! # Drain Loop
//!
//! Background retrieval of postponed messages, run as discrete quanta on a
//! [`TaskScheduler`]. A quantum runs iterations until one makes no progress,
//! fails, or the per-step budget is spent, and then always reports back
//! through [`DrainWork::drain_quantum_finished`]. The block decides there,
//! under its lock, whether to submit another quantum or finalize.

use crate::constants::events;
use crate::error::{DataflowError, Result};
use crate::scheduling::{SchedulerError, TaskScheduler};
use std::sync::Arc;
use tracing::{debug, instrument};

/// A block whose postponed backlog can be drained in the background
pub trait DrainWork: Send + Sync + 'static {
    /// Name used in drain logs
    fn drain_name(&self) -> &str;

    /// Run one retrieval step. `Ok(true)` means progress was made.
    fn drain_iteration(&self) -> Result<bool>;

    /// The iteration failed; the drain stops after this call
    fn drain_failed(&self, error: DataflowError);

    /// Called exactly once at the end of every quantum
    fn drain_quantum_finished(self: Arc<Self>);
}

/// Outcome of one drain quantum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantumOutcome {
    /// An iteration made no progress
    Idle,
    /// The iteration budget ran out while work was still progressing
    BudgetExhausted,
    /// An iteration failed
    Failed,
}

#[instrument(skip(work), fields(block = %work.drain_name()))]
pub fn run_drain_quantum<W: DrainWork>(work: Arc<W>, max_iterations: usize) -> QuantumOutcome {
    let budget = max_iterations.max(1);
    let mut iterations = 0usize;

    let outcome = loop {
        match work.drain_iteration() {
            Ok(true) => {
                iterations += 1;
                if iterations >= budget {
                    debug!(
                        iterations = iterations,
                        event = events::DRAIN_RESCHEDULED,
                        "🔁 DRAIN: iteration budget exhausted"
                    );
                    break QuantumOutcome::BudgetExhausted;
                }
            }
            Ok(false) => break QuantumOutcome::Idle,
            Err(error) => {
                work.drain_failed(error);
                break QuantumOutcome::Failed;
            }
        }
    };

    work.drain_quantum_finished();
    outcome
}

/// Submit one drain quantum
pub fn schedule_drain<W: DrainWork>(
    scheduler: &dyn TaskScheduler,
    work: Arc<W>,
    max_iterations: usize,
) -> std::result::Result<(), SchedulerError> {
    scheduler.schedule(Box::new(move || {
        run_drain_quantum(work, max_iterations);
    }))
}
