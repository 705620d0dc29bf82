//! Typed batched-join targets.
//!
//! Targets accept immediately; there is no postponement or reservation.
//! The shared countdown and emission live behind [`BatchedJoinCoordinator`].

use crate::coordination::{CompletionState, FollowUp};
use crate::error::{DataflowError, Result};
use crate::messaging::target::validate_offer;
use crate::messaging::{MessageHeader, OfferStatus, SourceHandle, TargetBlock, TargetId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Shared batched-join bookkeeping guarded by the block lock
#[derive(Debug)]
pub struct BatchedJoinCoordination {
    pub(crate) batch_size: usize,
    pub(crate) remaining_items_in_batch: usize,
    pub(crate) batches_created: u64,
    pub(crate) max_groups: u64,
    pub(crate) alive_targets: usize,
    pub(crate) target_completed: Vec<bool>,
    pub(crate) in_flight_consumes: usize,
    pub(crate) completion: CompletionState,
}

impl BatchedJoinCoordination {
    pub(crate) fn new(width: usize, batch_size: usize, max_groups: u64) -> Self {
        Self {
            batch_size,
            remaining_items_in_batch: batch_size,
            batches_created: 0,
            max_groups,
            alive_targets: width,
            target_completed: vec![false; width],
            in_flight_consumes: 0,
            completion: CompletionState::default(),
        }
    }

    pub(crate) fn is_target_declining(&self, index: usize) -> bool {
        self.completion.is_declining() || self.target_completed[index]
    }

    /// Mark a target done. Returns false if it already was.
    pub(crate) fn complete_target(&mut self, index: usize) -> bool {
        if self.target_completed[index] {
            return false;
        }
        self.target_completed[index] = true;
        self.alive_targets = self.alive_targets.saturating_sub(1);
        true
    }
}

/// Block-side operations a batched-join target calls back into
pub trait BatchedJoinCoordinator: Send + Sync {
    fn core(&self) -> &Mutex<BatchedJoinCoordination>;

    fn block_name(&self) -> &str;

    /// Count one accepted item against the countdown
    fn item_added(&self, core: &mut BatchedJoinCoordination) -> FollowUp;

    fn complete_if_possible(&self, core: &mut BatchedJoinCoordination) -> FollowUp;

    fn complete_locked(
        &self,
        core: &mut BatchedJoinCoordination,
        error: Option<DataflowError>,
        drop_pending: bool,
    ) -> FollowUp;

    fn run_follow_up(self: Arc<Self>, follow_up: FollowUp);
}

/// Type-erased view of one batched-join target
pub trait BatchedJoinParticipant: Send + Sync {
    fn index(&self) -> usize;

    fn buffered(&self) -> usize;

    fn clear_buffered(&self) -> usize;
}

/// One typed input of a batched-join block
pub struct BatchedJoinTarget<T> {
    index: usize,
    id: TargetId,
    coordinator: Weak<dyn BatchedJoinCoordinator>,
    messages: Mutex<Vec<T>>,
}

impl<T: Send + 'static> BatchedJoinTarget<T> {
    pub(crate) fn new(index: usize, coordinator: Weak<dyn BatchedJoinCoordinator>) -> Self {
        Self {
            index,
            id: TargetId::new(),
            coordinator,
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn position(&self) -> usize {
        self.index
    }

    pub fn buffered_count(&self) -> usize {
        self.messages.lock().len()
    }

    /// Take the whole list. Call with the block lock held.
    pub(crate) fn take_all(&self) -> Vec<T> {
        std::mem::take(&mut *self.messages.lock())
    }

    fn accept_consumed(
        &self,
        coordinator: &Arc<dyn BatchedJoinCoordinator>,
        header: MessageHeader,
        consumed: Result<Option<T>>,
    ) -> OfferStatus {
        let mut core = coordinator.core().lock();
        core.in_flight_consumes -= 1;

        let (status, follow_up) = match consumed {
            Ok(Some(value)) if !core.completion.is_declining() => {
                self.messages.lock().push(value);
                (OfferStatus::Accepted, coordinator.item_added(&mut core))
            }
            Ok(Some(_)) => {
                debug!(
                    block = %coordinator.block_name(),
                    header = %header,
                    "BATCHED JOIN: consumed message dropped, block is declining"
                );
                (
                    OfferStatus::Accepted,
                    coordinator.complete_if_possible(&mut core),
                )
            }
            Ok(None) => (
                OfferStatus::NotAvailable,
                coordinator.complete_if_possible(&mut core),
            ),
            Err(error) => {
                warn!(
                    block = %coordinator.block_name(),
                    position = self.index,
                    error = %error,
                    "⚠️ BATCHED JOIN: consume-to-accept failed"
                );
                core.completion
                    .add_faults([DataflowError::SourceFailure(error.to_string())]);
                (
                    OfferStatus::NotAvailable,
                    coordinator.complete_locked(&mut core, None, true),
                )
            }
        };

        drop(core);
        Arc::clone(coordinator).run_follow_up(follow_up);
        status
    }
}

impl<T> fmt::Debug for BatchedJoinTarget<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchedJoinTarget")
            .field("position", &self.index)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> TargetBlock<T> for BatchedJoinTarget<T> {
    fn id(&self) -> TargetId {
        self.id
    }

    fn offer(
        &self,
        header: MessageHeader,
        value: T,
        source: Option<SourceHandle<T>>,
        consume_to_accept: bool,
    ) -> Result<OfferStatus> {
        validate_offer(header, source.is_some(), consume_to_accept)?;
        let Some(coordinator) = self.coordinator.upgrade() else {
            return Ok(OfferStatus::DecliningPermanently);
        };

        let mut core = coordinator.core().lock();
        if core.is_target_declining(self.index) {
            return Ok(OfferStatus::DecliningPermanently);
        }

        if consume_to_accept {
            let Some(source) = source else {
                return Err(DataflowError::MissingSource);
            };
            core.in_flight_consumes += 1;
            drop(core);

            let consumed = source.consume(header, self.id);
            return Ok(self.accept_consumed(&coordinator, header, consumed));
        }

        self.messages.lock().push(value);
        let follow_up = coordinator.item_added(&mut core);
        drop(core);
        coordinator.run_follow_up(follow_up);
        Ok(OfferStatus::Accepted)
    }

    /// Counts down the block's alive targets once
    fn complete(&self) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        let follow_up = {
            let mut core = coordinator.core().lock();
            if core.complete_target(self.index) {
                debug!(
                    block = %coordinator.block_name(),
                    position = self.index,
                    alive_targets = core.alive_targets,
                    "🔗 BATCHED JOIN: target completed"
                );
            }
            coordinator.complete_if_possible(&mut core)
        };
        coordinator.run_follow_up(follow_up);
    }

    /// Faults the whole batched-join block
    fn fault(&self, error: DataflowError) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        let follow_up = {
            let mut core = coordinator.core().lock();
            coordinator.complete_locked(&mut core, Some(error), true)
        };
        coordinator.run_follow_up(follow_up);
    }
}

impl<T: Send + 'static> BatchedJoinParticipant for BatchedJoinTarget<T> {
    fn index(&self) -> usize {
        self.index
    }

    fn buffered(&self) -> usize {
        self.messages.lock().len()
    }

    fn clear_buffered(&self) -> usize {
        let mut messages = self.messages.lock();
        let dropped = messages.len();
        messages.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_target_counts_down_once() {
        let mut core = BatchedJoinCoordination::new(2, 4, u64::MAX);
        assert!(core.complete_target(0));
        assert!(!core.complete_target(0));
        assert_eq!(core.alive_targets, 1);
        assert!(core.is_target_declining(0));
        assert!(!core.is_target_declining(1));
    }
}
