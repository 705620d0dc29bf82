//! # Completion Coordination
//!
//! The decline / reserve / finalize state machine shared by every block:
//!
//! ```text
//! Accepting ──complete/fault/quota/cancel──▶ DecliningPermanently
//!     ──(no drain or consume in flight, nothing left to form)──▶ CompletionReserved
//!     ──(finalization on the scheduler)──▶ Completed(CompletionStatus)
//! ```
//!
//! `completion_reserved` flips at most once, under the block lock. Everything
//! after it (releasing postponed messages, publishing the terminal status)
//! runs with the lock released.

use crate::error::{AggregateFault, DataflowError};
use crate::scheduling::{SchedulerError, TaskScheduler};
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Terminal state of a block
#[derive(Debug, Clone)]
pub enum CompletionStatus {
    RanToCompletion,
    Faulted(AggregateFault),
    Canceled,
}

impl CompletionStatus {
    pub fn is_ran_to_completion(&self) -> bool {
        matches!(self, CompletionStatus::RanToCompletion)
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, CompletionStatus::Faulted(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, CompletionStatus::Canceled)
    }

    pub fn fault(&self) -> Option<&AggregateFault> {
        match self {
            CompletionStatus::Faulted(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Awaitable view of a block's completion
#[derive(Debug, Clone)]
pub struct Completion {
    receiver: watch::Receiver<Option<CompletionStatus>>,
}

impl Completion {
    /// Wait for the terminal status.
    ///
    /// A block dropped before finishing reports `Canceled`.
    pub async fn wait(&self) -> CompletionStatus {
        let mut receiver = self.receiver.clone();
        let status = match receiver.wait_for(Option::is_some).await {
            Ok(status) => status.clone(),
            Err(_) => None,
        };
        status.unwrap_or(CompletionStatus::Canceled)
    }

    pub fn status(&self) -> Option<CompletionStatus> {
        self.receiver.borrow().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.receiver.borrow().is_some()
    }
}

/// Write side of a [`Completion`]; resolves at most once
#[derive(Debug)]
pub struct CompletionSignal {
    sender: watch::Sender<Option<CompletionStatus>>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(None);
        Self { sender }
    }

    pub fn subscribe(&self) -> Completion {
        Completion {
            receiver: self.sender.subscribe(),
        }
    }

    /// Returns false when the signal was already resolved
    pub fn resolve(&self, status: CompletionStatus) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        })
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion bookkeeping kept under the block lock
#[derive(Debug, Default)]
pub struct CompletionState {
    declining_permanently: bool,
    completion_reserved: bool,
    canceled: bool,
    faults: Vec<DataflowError>,
}

impl CompletionState {
    pub fn is_declining(&self) -> bool {
        self.declining_permanently
    }

    /// Returns true on the first transition into declining
    pub fn decline(&mut self) -> bool {
        let newly = !self.declining_permanently;
        self.declining_permanently = true;
        newly
    }

    pub fn is_completion_reserved(&self) -> bool {
        self.completion_reserved
    }

    /// Check-and-set; only the first caller wins
    pub fn try_reserve_completion(&mut self) -> bool {
        if self.completion_reserved {
            return false;
        }
        self.completion_reserved = true;
        self.declining_permanently = true;
        true
    }

    pub fn mark_canceled(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn has_faults(&self) -> bool {
        !self.faults.is_empty()
    }

    pub fn canceled_or_faulted(&self) -> bool {
        self.canceled || self.has_faults()
    }

    /// Record a fault unless the block already declines.
    ///
    /// Failures raised while releasing reservations are always recorded.
    pub fn record_fault(&mut self, error: DataflowError, releasing_reserved: bool) -> bool {
        if self.declining_permanently && !releasing_reserved {
            debug!(error = %error, "Fault ignored: block is already declining");
            return false;
        }
        self.faults.push(error);
        true
    }

    pub fn add_faults(&mut self, errors: impl IntoIterator<Item = DataflowError>) {
        self.faults.extend(errors);
    }

    /// Consume the accumulated outcome. Faults take precedence over cancellation.
    pub fn take_status(&mut self) -> CompletionStatus {
        if !self.faults.is_empty() {
            CompletionStatus::Faulted(AggregateFault::new(std::mem::take(&mut self.faults)))
        } else if self.canceled {
            CompletionStatus::Canceled
        } else {
            CompletionStatus::RanToCompletion
        }
    }
}

/// Work decided under the block lock that must run after it is released
#[must_use]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FollowUp {
    /// Hand queued groups to the output sink
    pub publish: bool,
    /// Submit a drain quantum to the scheduler
    pub start_drain: bool,
    /// Submit finalization to the scheduler
    pub finalize: bool,
}

impl FollowUp {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn publish() -> Self {
        Self {
            publish: true,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: FollowUp) {
        self.publish |= other.publish;
        self.start_drain |= other.start_drain;
        self.finalize |= other.finalize;
    }

    pub fn is_empty(&self) -> bool {
        !(self.publish || self.start_drain || self.finalize)
    }
}

/// Route a cancellation token into a block.
///
/// A token that is already canceled runs `on_cancel` immediately. Otherwise a
/// watcher is scheduled that fires `on_cancel` on cancellation and exits once
/// the block completes.
pub fn watch_cancellation<F>(
    scheduler: &dyn TaskScheduler,
    token: CancellationToken,
    completion: Completion,
    on_cancel: F,
) -> Result<(), SchedulerError>
where
    F: FnOnce() + Send + 'static,
{
    if token.is_cancelled() {
        on_cancel();
        return Ok(());
    }

    scheduler.schedule_future(
        async move {
            tokio::select! {
                _ = token.cancelled() => on_cancel(),
                _ = completion.wait() => {}
            }
        }
        .boxed(),
    )
}
