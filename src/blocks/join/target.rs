//! Typed join targets and the coordination seam they share.
//!
//! Each [`JoinTarget`] owns the typed state for one tuple position. All
//! cross-target decisions (room, tie-breaks, quotas, tuple formation) live
//! behind [`JoinCoordinator`], reached through a non-owning `Weak` handle.
//!
//! Lock order is block lock, then target state. A target state lock is never
//! held while acquiring the block lock or while calling into a source.

use crate::coordination::postponed::release_postponed;
use crate::coordination::{
    BoundingState, CompletionState, FollowUp, PostponedMessage, PostponedMessages,
};
use crate::error::{DataflowError, Result};
use crate::messaging::target::validate_offer;
use crate::messaging::{MessageHeader, OfferStatus, SourceHandle, TargetBlock, TargetId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Shared join bookkeeping guarded by the block lock
#[derive(Debug)]
pub struct JoinCoordination {
    pub(crate) greedy: bool,
    /// Postponement and the drain loop exist (non-greedy or bounded)
    pub(crate) non_greedy: bool,
    /// Counts formed tuples that have not left the output buffer
    pub(crate) bounding: Option<BoundingState>,
    pub(crate) tuples_created: u64,
    pub(crate) max_groups: u64,
    pub(crate) drain_in_flight: bool,
    /// Consumes running outside the lock, per target
    pub(crate) in_flight: Vec<usize>,
    pub(crate) target_declining: Vec<bool>,
    pub(crate) completion: CompletionState,
}

impl JoinCoordination {
    pub(crate) fn new(
        width: usize,
        greedy: bool,
        bounded_capacity: Option<usize>,
        max_groups: u64,
    ) -> Self {
        Self {
            greedy,
            non_greedy: !greedy || bounded_capacity.is_some(),
            bounding: bounded_capacity.map(BoundingState::new),
            tuples_created: 0,
            max_groups,
            drain_in_flight: false,
            in_flight: vec![0; width],
            target_declining: vec![false; width],
            completion: CompletionState::default(),
        }
    }

    pub(crate) fn is_target_declining(&self, index: usize) -> bool {
        self.completion.is_declining() || self.target_declining[index]
    }

    pub(crate) fn is_processing(&self) -> bool {
        self.drain_in_flight || self.in_flight.iter().any(|count| *count > 0)
    }
}

/// Block-side operations a target calls back into
pub trait JoinCoordinator: Send + Sync {
    fn core(&self) -> &Mutex<JoinCoordination>;

    fn block_name(&self) -> &str;

    /// Greedy fast path: may target `index` take an offered item right now
    fn can_accept_now(&self, core: &JoinCoordination, index: usize, postponed_empty: bool) -> bool;

    /// Bounded-greedy backlog rule for target `index`
    fn may_consume_postponed(&self, core: &JoinCoordination, index: usize) -> bool;

    fn after_item_buffered(&self, core: &mut JoinCoordination) -> FollowUp;

    fn process_async_if_necessary(&self, core: &mut JoinCoordination) -> FollowUp;

    fn complete_if_possible(&self, core: &mut JoinCoordination) -> FollowUp;

    fn complete_locked(
        &self,
        core: &mut JoinCoordination,
        error: Option<DataflowError>,
        drop_pending: bool,
    ) -> FollowUp;

    fn run_follow_up(self: Arc<Self>, follow_up: FollowUp);
}

/// Type-erased view of one target used by the coordinator
pub trait JoinParticipant: Send + Sync {
    fn index(&self) -> usize;

    fn buffered(&self) -> usize;

    fn postponed_len(&self) -> usize;

    fn has_reservation(&self) -> bool;

    /// Drop buffered items, returning how many were dropped
    fn clear_buffered(&self) -> usize;

    /// Reserve one postponed message, skipping refused candidates
    fn reserve_one(&self) -> Result<bool>;

    /// Consume the held reservation into the buffer
    fn consume_reserved(&self, core: &Mutex<JoinCoordination>) -> Result<()>;

    fn release_reserved(&self) -> Result<()>;

    /// Bounded-greedy: consume one postponed message without reserving
    fn consume_one_postponed(&self, coordinator: &dyn JoinCoordinator) -> Result<bool>;

    /// Hand every postponed or reserved message back to its source
    fn release_all_postponed(&self) -> Vec<DataflowError>;
}

struct JoinTargetState<T> {
    messages: VecDeque<T>,
    postponed: PostponedMessages<T>,
    reserved: Option<PostponedMessage<T>>,
}

/// One typed input of a join block
pub struct JoinTarget<T> {
    index: usize,
    id: TargetId,
    coordinator: Weak<dyn JoinCoordinator>,
    state: Mutex<JoinTargetState<T>>,
}

impl<T: Send + 'static> JoinTarget<T> {
    pub(crate) fn new(index: usize, coordinator: Weak<dyn JoinCoordinator>) -> Self {
        Self {
            index,
            id: TargetId::new(),
            coordinator,
            state: Mutex::new(JoinTargetState {
                messages: VecDeque::new(),
                postponed: PostponedMessages::new(),
                reserved: None,
            }),
        }
    }

    /// Tuple position this target feeds
    pub fn position(&self) -> usize {
        self.index
    }

    pub fn buffered_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn postponed_count(&self) -> usize {
        self.state.lock().postponed.len()
    }

    /// Pop the oldest buffered item. Call with the block lock held.
    pub(crate) fn pop_front(&self) -> Option<T> {
        self.state.lock().messages.pop_front()
    }

    fn commit_consumed(
        &self,
        coordinator: &Arc<dyn JoinCoordinator>,
        consumed: Result<Option<T>>,
    ) -> OfferStatus {
        let mut core = coordinator.core().lock();
        core.in_flight[self.index] -= 1;

        let (status, follow_up) = match consumed {
            Ok(Some(value)) if !core.completion.canceled_or_faulted() => {
                self.state.lock().messages.push_back(value);
                (
                    OfferStatus::Accepted,
                    coordinator.after_item_buffered(&mut core),
                )
            }
            Ok(Some(_)) => (
                OfferStatus::Accepted,
                coordinator.complete_if_possible(&mut core),
            ),
            Ok(None) => (
                OfferStatus::NotAvailable,
                coordinator.complete_if_possible(&mut core),
            ),
            Err(error) => {
                warn!(
                    block = %coordinator.block_name(),
                    position = self.index,
                    error = %error,
                    "⚠️ JOIN: consume-to-accept failed"
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

impl<T> fmt::Debug for JoinTarget<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinTarget")
            .field("position", &self.index)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> TargetBlock<T> for JoinTarget<T> {
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
            let follow_up = coordinator.complete_if_possible(&mut core);
            drop(core);
            coordinator.run_follow_up(follow_up);
            return Ok(OfferStatus::DecliningPermanently);
        }

        let postponed_empty = self.state.lock().postponed.is_empty();
        if coordinator.can_accept_now(&core, self.index, postponed_empty) {
            if consume_to_accept {
                let Some(source) = source else {
                    return Err(DataflowError::MissingSource);
                };
                core.in_flight[self.index] += 1;
                drop(core);

                let consumed = source.consume(header, self.id);
                return Ok(self.commit_consumed(&coordinator, consumed));
            }

            self.state.lock().messages.push_back(value);
            let follow_up = coordinator.after_item_buffered(&mut core);
            drop(core);
            coordinator.run_follow_up(follow_up);
            return Ok(OfferStatus::Accepted);
        }

        if let Some(source) = source {
            if core.non_greedy {
                self.state.lock().postponed.push(source, header);
                let follow_up = coordinator.process_async_if_necessary(&mut core);
                drop(core);
                coordinator.run_follow_up(follow_up);
                return Ok(OfferStatus::Postponed);
            }
        }

        Ok(OfferStatus::Declined)
    }

    /// The upstream feeding this position is done
    fn complete(&self) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        let follow_up = {
            let mut core = coordinator.core().lock();
            if !core.target_declining[self.index] {
                core.target_declining[self.index] = true;
                debug!(
                    block = %coordinator.block_name(),
                    position = self.index,
                    "🔗 JOIN: target completed"
                );
            }
            coordinator.complete_if_possible(&mut core)
        };
        coordinator.run_follow_up(follow_up);
    }

    /// Faults the whole join block
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

impl<T: Send + 'static> JoinParticipant for JoinTarget<T> {
    fn index(&self) -> usize {
        self.index
    }

    fn buffered(&self) -> usize {
        self.state.lock().messages.len()
    }

    fn postponed_len(&self) -> usize {
        self.state.lock().postponed.len()
    }

    fn has_reservation(&self) -> bool {
        self.state.lock().reserved.is_some()
    }

    fn clear_buffered(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.messages.len();
        state.messages.clear();
        dropped
    }

    fn reserve_one(&self) -> Result<bool> {
        loop {
            let Some(candidate) = self.state.lock().postponed.pop() else {
                return Ok(false);
            };
            match candidate.source.reserve(candidate.header, self.id) {
                Ok(true) => {
                    self.state.lock().reserved = Some(candidate);
                    return Ok(true);
                }
                Ok(false) => {
                    debug!(position = self.index, header = %candidate.header, "JOIN: reservation refused");
                }
                Err(error) => return Err(DataflowError::SourceFailure(error.to_string())),
            }
        }
    }

    fn consume_reserved(&self, core: &Mutex<JoinCoordination>) -> Result<()> {
        let Some(reserved) = self.state.lock().reserved.take() else {
            return Err(DataflowError::ProtocolViolation(format!(
                "join target {} has no reservation to consume",
                self.index
            )));
        };

        match reserved.source.consume(reserved.header, self.id) {
            Ok(Some(value)) => {
                let _core = core.lock();
                self.state.lock().messages.push_back(value);
                Ok(())
            }
            Ok(None) => Err(DataflowError::ProtocolViolation(format!(
                "source failed to deliver reserved message {}",
                reserved.header
            ))),
            Err(error) => Err(DataflowError::ProtocolViolation(format!(
                "source failed to deliver reserved message {}: {error}",
                reserved.header
            ))),
        }
    }

    fn release_reserved(&self) -> Result<()> {
        let reserved = self.state.lock().reserved.take();
        match reserved {
            Some(message) => message.source.release(message.header, self.id),
            None => Ok(()),
        }
    }

    fn consume_one_postponed(&self, coordinator: &dyn JoinCoordinator) -> Result<bool> {
        let candidate = {
            let mut core = coordinator.core().lock();
            if core.completion.is_declining()
                || !coordinator.may_consume_postponed(&core, self.index)
            {
                return Ok(false);
            }
            let Some(candidate) = self.state.lock().postponed.pop() else {
                return Ok(false);
            };
            core.in_flight[self.index] += 1;
            candidate
        };

        let consumed = candidate.source.consume(candidate.header, self.id);

        let mut core = coordinator.core().lock();
        core.in_flight[self.index] -= 1;
        match consumed {
            Ok(Some(value)) => {
                self.state.lock().messages.push_back(value);
                Ok(true)
            }
            Ok(None) => {
                debug!(
                    position = self.index,
                    header = %candidate.header,
                    "JOIN: postponed message no longer available"
                );
                Ok(true)
            }
            Err(error) => Err(DataflowError::SourceFailure(error.to_string())),
        }
    }

    fn release_all_postponed(&self) -> Vec<DataflowError> {
        let postponed = self.state.lock().postponed.drain_all();
        let mut errors = release_postponed(postponed, self.id);
        if let Err(error) = self.release_reserved() {
            errors.push(error);
        }
        errors
    }
}
