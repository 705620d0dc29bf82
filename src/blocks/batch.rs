//! # Batch Block
//!
//! Accumulates messages of one type into fixed-size `Vec<T>` groups.
//!
//! ## Modes
//!
//! - **Greedy, unbounded**: every offer is taken immediately and a batch is
//!   emitted as soon as `batch_size` messages are queued.
//! - **Greedy, bounded**: offers are taken immediately while there is free
//!   capacity, no postponed backlog and no drain in flight; otherwise they are
//!   postponed and pulled later by the drain loop without reservation.
//! - **Non-greedy**: offers are always postponed. The drain loop reserves a
//!   full batch worth of postponed messages and consumes them only when all
//!   reservations succeed (or any count under [`BatchBlock::trigger_batch`]).
//!
//! On completion a trailing undersized batch is flushed unless the block was
//! canceled, faulted or already met its group quota.
//!
//! ```rust,no_run
//! use tasker_dataflow::blocks::BatchBlock;
//! use tasker_dataflow::config::GroupingBlockOptions;
//! use tasker_dataflow::messaging::{MessageHeader, TargetBlock};
//!
//! #[tokio::main]
//! async fn main() -> tasker_dataflow::Result<()> {
//!     let batch = BatchBlock::new(2, GroupingBlockOptions::default())?;
//!     for (id, value) in ["a", "b", "c"].into_iter().enumerate() {
//!         batch.offer(MessageHeader::new(id as u64 + 1), value, None, false)?;
//!     }
//!     batch.complete();
//!
//!     while let Some(group) = batch.receive().await {
//!         println!("{group:?}");
//!     }
//!     Ok(())
//! }
//! ```

use crate::config::GroupingBlockOptions;
use crate::constants::{block_kinds, events};
use crate::coordination::completion::watch_cancellation;
use crate::coordination::drain::{schedule_drain, DrainWork};
use crate::coordination::postponed::{release_postponed, release_reservations};
use crate::coordination::{
    BoundingState, Completion, CompletionSignal, CompletionState, FollowUp, GroupPublisher,
    OutputBuffer, PostponedMessage, PostponedMessages,
};
use crate::error::{DataflowError, Result};
use crate::logging::log_block_operation;
use crate::messaging::target::validate_offer;
use crate::messaging::{MessageHeader, OfferStatus, SourceHandle, TargetBlock, TargetId};
use crate::scheduling::TaskScheduler;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Groups messages into batches of `batch_size`
pub struct BatchBlock<T> {
    shared: Arc<BatchShared<T>>,
}

struct BatchShared<T> {
    id: TargetId,
    name: String,
    batch_size: usize,
    greedy: bool,
    max_groups: u64,
    max_iterations: usize,
    scheduler: Arc<dyn TaskScheduler>,
    state: Mutex<BatchState<T>>,
    publisher: GroupPublisher<Vec<T>>,
    output: Arc<OutputBuffer<Vec<T>>>,
    completion: Completion,
}

struct BatchState<T> {
    messages: VecDeque<T>,
    batches_completed: u64,
    completion: CompletionState,
    /// Present for non-greedy and bounded blocks
    non_greedy: Option<NonGreedyState<T>>,
    bounding: Option<BoundingState>,
    /// Greedy consume-to-accept offers whose consume runs outside the lock
    in_flight_consumes: usize,
}

struct NonGreedyState<T> {
    postponed: PostponedMessages<T>,
    drain_in_flight: bool,
    accept_fewer: bool,
}

impl<T> NonGreedyState<T> {
    fn new() -> Self {
        Self {
            postponed: PostponedMessages::new(),
            drain_in_flight: false,
            accept_fewer: false,
        }
    }
}

impl<T: Send + 'static> BatchBlock<T> {
    /// Create a batch block.
    ///
    /// Fails on a zero batch size, a bounded capacity smaller than the batch
    /// size, invalid settings, or when no scheduler is available.
    pub fn new(batch_size: usize, options: GroupingBlockOptions) -> Result<Self> {
        if batch_size == 0 {
            return Err(DataflowError::InvalidBatchSize(batch_size));
        }
        options.settings.validate()?;

        let bounded_capacity = options.settings.bounded_capacity();
        if let Some(capacity) = bounded_capacity {
            if capacity < batch_size {
                return Err(DataflowError::BoundedCapacityBelowBatchSize {
                    bounded_capacity: capacity,
                    batch_size,
                });
            }
        }

        let scheduler = options.resolve_scheduler()?;
        let id = TargetId::new();
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", block_kinds::BATCH, id));
        let greedy = options.settings.greedy;

        let output = Arc::new(OutputBuffer::with_weigher(Vec::<T>::len));
        let signal = CompletionSignal::new();
        let completion = signal.subscribe();
        let publisher = GroupPublisher::new(output.clone(), signal);

        let shared = Arc::new(BatchShared {
            id,
            name,
            batch_size,
            greedy,
            max_groups: options.settings.max_groups_limit(),
            max_iterations: options.settings.max_iterations_per_drain_step,
            scheduler,
            state: Mutex::new(BatchState {
                messages: VecDeque::new(),
                batches_completed: 0,
                completion: CompletionState::default(),
                non_greedy: (!greedy || bounded_capacity.is_some()).then(NonGreedyState::new),
                bounding: bounded_capacity.map(BoundingState::new),
                in_flight_consumes: 0,
            }),
            publisher,
            output: output.clone(),
            completion,
        });

        if bounded_capacity.is_some() {
            let weak = Arc::downgrade(&shared);
            output.set_removal_hook(move |count| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_items_removed(count);
                }
            });
        }

        info!(
            block = %shared.name,
            batch_size = batch_size,
            greedy = greedy,
            bounded_capacity = ?bounded_capacity,
            event = events::BLOCK_CREATED,
            "📦 BATCH: block created"
        );

        if let Some(token) = options.cancellation.clone() {
            let weak = Arc::downgrade(&shared);
            let registered = watch_cancellation(
                shared.scheduler.as_ref(),
                token,
                shared.completion.clone(),
                move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.cancel();
                    }
                },
            );
            if let Err(error) = registered {
                shared.complete_core(Some(error.into()), true, false, false);
            }
        }

        Ok(Self { shared })
    }

    /// Emit a batch from whatever is available, even if undersized
    pub fn trigger_batch(&self) {
        self.shared.trigger_batch();
    }

    pub fn id(&self) -> TargetId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn batch_size(&self) -> usize {
        self.shared.batch_size
    }

    pub fn output(&self) -> &Arc<OutputBuffer<Vec<T>>> {
        &self.shared.output
    }

    pub fn try_receive(&self) -> Option<Vec<T>> {
        self.shared.output.try_receive()
    }

    pub async fn receive(&self) -> Option<Vec<T>> {
        self.shared.output.receive().await
    }

    pub fn receive_all(&self) -> Vec<Vec<T>> {
        self.shared.output.receive_all()
    }

    /// Batches waiting in the output buffer
    pub fn output_count(&self) -> usize {
        self.shared.output.count()
    }

    pub fn completion(&self) -> Completion {
        self.shared.completion.clone()
    }

    pub fn batches_completed(&self) -> u64 {
        self.shared.state.lock().batches_completed
    }

    pub fn postponed_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .non_greedy
            .as_ref()
            .map_or(0, |non_greedy| non_greedy.postponed.len())
    }

    /// Items currently counted against the bounded capacity
    pub fn bounded_count(&self) -> Option<usize> {
        self.shared
            .state
            .lock()
            .bounding
            .map(|bounding| bounding.current())
    }
}

impl<T> Clone for BatchBlock<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for BatchBlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBlock")
            .field("name", &self.shared.name)
            .field("batch_size", &self.shared.batch_size)
            .field("greedy", &self.shared.greedy)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> TargetBlock<T> for BatchBlock<T> {
    fn id(&self) -> TargetId {
        self.shared.id
    }

    fn offer(
        &self,
        header: MessageHeader,
        value: T,
        source: Option<SourceHandle<T>>,
        consume_to_accept: bool,
    ) -> Result<OfferStatus> {
        self.shared.offer(header, value, source, consume_to_accept)
    }

    fn complete(&self) {
        debug!(block = %self.shared.name, "🏁 BATCH: completion requested");
        self.shared.complete_core(None, false, false, false);
    }

    fn fault(&self, error: DataflowError) {
        self.shared.complete_core(Some(error), true, false, false);
    }
}

impl<T: Send + 'static> BatchShared<T> {
    fn offer(
        self: &Arc<Self>,
        header: MessageHeader,
        value: T,
        source: Option<SourceHandle<T>>,
        consume_to_accept: bool,
    ) -> Result<OfferStatus> {
        validate_offer(header, source.is_some(), consume_to_accept)?;

        let mut state = self.state.lock();
        if state.completion.is_declining() {
            let follow_up = self.complete_if_possible(&mut state);
            drop(state);
            self.run_follow_up(follow_up);
            return Ok(OfferStatus::DecliningPermanently);
        }

        if self.can_accept_now(&state) {
            if consume_to_accept {
                let Some(source) = source else {
                    return Err(DataflowError::MissingSource);
                };
                if let Some(bounding) = state.bounding.as_mut() {
                    bounding.charge(1);
                }
                state.in_flight_consumes += 1;
                drop(state);

                let consumed = source.consume(header, self.id);
                return Ok(self.commit_consumed(consumed));
            }

            let follow_up = self.accept_message(&mut state, value, true);
            drop(state);
            self.run_follow_up(follow_up);
            return Ok(OfferStatus::Accepted);
        }

        if let Some(source) = source {
            if let Some(non_greedy) = state.non_greedy.as_mut() {
                non_greedy.postponed.push(source, header);
                let follow_up = self.process_async_if_necessary(&mut state);
                drop(state);
                self.run_follow_up(follow_up);
                return Ok(OfferStatus::Postponed);
            }
        }

        Ok(OfferStatus::Declined)
    }

    fn can_accept_now(&self, state: &BatchState<T>) -> bool {
        match &state.non_greedy {
            None => true,
            Some(non_greedy) => {
                self.greedy
                    && !non_greedy.drain_in_flight
                    && non_greedy.postponed.is_empty()
                    && state.bounding.map_or(true, |bounding| bounding.has_room())
            }
        }
    }

    /// Re-enter the lock after a consume-to-accept offer
    fn commit_consumed(self: &Arc<Self>, consumed: Result<Option<T>>) -> OfferStatus {
        let mut state = self.state.lock();
        state.in_flight_consumes -= 1;

        let (status, follow_up) = match consumed {
            Ok(Some(value))
                if !state.completion.canceled_or_faulted()
                    && state.batches_completed < self.max_groups =>
            {
                let follow_up = self.accept_message(&mut state, value, false);
                (OfferStatus::Accepted, follow_up)
            }
            Ok(Some(_)) => {
                Self::credit(&mut state, 1);
                debug!(
                    block = %self.name,
                    batches_completed = state.batches_completed,
                    "BATCH: consumed message dropped, block is declining"
                );
                (OfferStatus::Accepted, self.complete_if_possible(&mut state))
            }
            Ok(None) => {
                Self::credit(&mut state, 1);
                (OfferStatus::NotAvailable, self.complete_if_possible(&mut state))
            }
            Err(error) => {
                Self::credit(&mut state, 1);
                warn!(block = %self.name, error = %error, "⚠️ BATCH: consume-to-accept failed");
                state
                    .completion
                    .add_faults([DataflowError::SourceFailure(error.to_string())]);
                let follow_up = self.complete_locked(&mut state, None, true, false, false);
                (OfferStatus::NotAvailable, follow_up)
            }
        };

        drop(state);
        self.run_follow_up(follow_up);
        status
    }

    /// Buffer an accepted value, then emit or decline as needed
    fn accept_message(&self, state: &mut BatchState<T>, value: T, charge: bool) -> FollowUp {
        state.messages.push_back(value);
        if charge {
            if let Some(bounding) = state.bounding.as_mut() {
                bounding.charge(1);
            }
        }

        let queued_batches = (state.messages.len() / self.batch_size) as u64;
        if state.batches_completed.saturating_add(queued_batches) >= self.max_groups {
            self.decline(state, "group quota reached");
        }

        let mut follow_up = FollowUp::none();
        if self.make_batch_if_possible(state, false) {
            follow_up.publish = true;
        }
        if state.completion.is_declining() {
            follow_up.merge(self.complete_if_possible(state));
        }
        follow_up
    }

    fn make_batch_if_possible(&self, state: &mut BatchState<T>, even_if_fewer: bool) -> bool {
        if state.batches_completed >= self.max_groups {
            return false;
        }
        let queued = state.messages.len();
        let full = queued >= self.batch_size;
        if !full && !(even_if_fewer && queued > 0) {
            return false;
        }

        let count = queued.min(self.batch_size);
        let batch: Vec<T> = state.messages.drain(..count).collect();
        state.batches_completed += 1;
        debug!(
            block = %self.name,
            batch_len = count,
            batches_completed = state.batches_completed,
            event = events::GROUP_EMITTED,
            "📦 BATCH: batch formed"
        );
        self.publisher.enqueue(batch);

        if state.batches_completed >= self.max_groups {
            self.decline(state, "group quota reached");
        }
        true
    }

    fn decline(&self, state: &mut BatchState<T>, reason: &str) {
        if state.completion.decline() {
            debug!(
                block = %self.name,
                reason = reason,
                event = events::BLOCK_DECLINING,
                "🚫 BATCH: declining permanently"
            );
        }
    }

    fn credit(state: &mut BatchState<T>, count: usize) {
        if let Some(bounding) = state.bounding.as_mut() {
            bounding.credit(count);
        }
    }

    fn is_processing(state: &BatchState<T>) -> bool {
        state.in_flight_consumes > 0
            || state
                .non_greedy
                .as_ref()
                .is_some_and(|non_greedy| non_greedy.drain_in_flight)
    }

    fn complete_if_possible(&self, state: &mut BatchState<T>) -> FollowUp {
        if state.completion.is_completion_reserved() || Self::is_processing(state) {
            return FollowUp::none();
        }

        let quota_met = state.batches_completed >= self.max_groups;
        let no_more_batches =
            state.completion.is_declining() && state.messages.len() < self.batch_size;
        let canceled_or_faulted = state.completion.canceled_or_faulted();
        if !(quota_met || no_more_batches || canceled_or_faulted) {
            return FollowUp::none();
        }

        if !state.completion.try_reserve_completion() {
            return FollowUp::none();
        }
        debug!(
            block = %self.name,
            event = events::BLOCK_COMPLETION_RESERVED,
            "🔒 BATCH: completion reserved"
        );

        let mut follow_up = FollowUp {
            finalize: true,
            ..FollowUp::default()
        };
        if !canceled_or_faulted && !quota_met && self.make_batch_if_possible(state, true) {
            follow_up.publish = true;
        }
        follow_up
    }

    fn has_drain_work(&self, state: &BatchState<T>) -> bool {
        let Some(non_greedy) = state.non_greedy.as_ref() else {
            return false;
        };
        if state.batches_completed >= self.max_groups {
            return false;
        }

        let needed = self.batch_size.saturating_sub(state.messages.len());
        let room = state
            .bounding
            .map_or(usize::MAX, |bounding| bounding.available());

        if self.greedy {
            (non_greedy.accept_fewer && !state.messages.is_empty())
                || (room > 0 && !non_greedy.postponed.is_empty())
        } else if non_greedy.postponed.is_empty() || room == 0 {
            false
        } else {
            non_greedy.accept_fewer || (non_greedy.postponed.len() >= needed && room >= needed)
        }
    }

    fn process_async_if_necessary(&self, state: &mut BatchState<T>) -> FollowUp {
        let idle = state
            .non_greedy
            .as_ref()
            .is_some_and(|non_greedy| !non_greedy.drain_in_flight);
        if !idle
            || state.completion.is_declining()
            || state.completion.is_completion_reserved()
            || !self.has_drain_work(state)
        {
            return FollowUp::none();
        }

        if let Some(non_greedy) = state.non_greedy.as_mut() {
            non_greedy.drain_in_flight = true;
        }
        FollowUp {
            start_drain: true,
            ..FollowUp::default()
        }
    }

    fn run_follow_up(self: &Arc<Self>, follow_up: FollowUp) {
        if follow_up.publish {
            self.publisher.publish();
        }
        if follow_up.start_drain {
            if let Err(error) =
                schedule_drain(self.scheduler.as_ref(), Arc::clone(self), self.max_iterations)
            {
                warn!(block = %self.name, error = %error, "⚠️ BATCH: failed to schedule drain");
                self.complete_core(Some(error.into()), true, true, true);
            }
        }
        if follow_up.finalize {
            self.schedule_finalize();
        }
    }

    fn complete_core(
        self: &Arc<Self>,
        error: Option<DataflowError>,
        drop_pending: bool,
        release_reserved: bool,
        revert_processing: bool,
    ) {
        let follow_up = {
            let mut state = self.state.lock();
            self.complete_locked(
                &mut state,
                error,
                drop_pending,
                release_reserved,
                revert_processing,
            )
        };
        self.run_follow_up(follow_up);
    }

    fn complete_locked(
        &self,
        state: &mut BatchState<T>,
        error: Option<DataflowError>,
        drop_pending: bool,
        release_reserved: bool,
        revert_processing: bool,
    ) -> FollowUp {
        if let Some(error) = error {
            let message = error.to_string();
            if state.completion.record_fault(error, release_reserved) {
                warn!(
                    block = %self.name,
                    error = %message,
                    event = events::BLOCK_FAULTED,
                    "💥 BATCH: fault recorded"
                );
            }
        }

        if drop_pending {
            let dropped = state.messages.len();
            state.messages.clear();
            Self::credit(state, dropped);
        }

        if revert_processing {
            if let Some(non_greedy) = state.non_greedy.as_mut() {
                non_greedy.drain_in_flight = false;
            }
        }

        self.decline(state, "completion requested");
        self.complete_if_possible(state)
    }

    fn cancel(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.completion.is_completion_reserved() {
                return;
            }
            state.completion.mark_canceled();
        }
        info!(block = %self.name, event = events::BLOCK_CANCELED, "🛑 BATCH: canceled");
        self.complete_core(None, true, false, false);
    }

    fn trigger_batch(self: &Arc<Self>) {
        let follow_up = {
            let mut state = self.state.lock();
            if state.completion.is_declining() {
                return;
            }

            let mut follow_up = FollowUp::none();
            if state.non_greedy.is_none() {
                if self.make_batch_if_possible(&mut state, true) {
                    follow_up.publish = true;
                }
            } else {
                if let Some(non_greedy) = state.non_greedy.as_mut() {
                    non_greedy.accept_fewer = true;
                }
                follow_up.merge(self.process_async_if_necessary(&mut state));
            }
            follow_up.merge(self.complete_if_possible(&mut state));
            follow_up
        };
        self.run_follow_up(follow_up);
    }

    fn on_items_removed(self: &Arc<Self>, count: usize) {
        let follow_up = {
            let mut state = self.state.lock();
            Self::credit(&mut state, count);
            let mut follow_up = self.process_async_if_necessary(&mut state);
            follow_up.merge(self.complete_if_possible(&mut state));
            follow_up
        };
        self.run_follow_up(follow_up);
    }

    fn schedule_finalize(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        if let Err(error) = self.scheduler.schedule(Box::new(move || shared.finalize())) {
            warn!(block = %self.name, error = %error, "⚠️ BATCH: finalizing inline");
            self.state
                .lock()
                .completion
                .add_faults([DataflowError::from(error)]);
            self.finalize();
        }
    }

    fn finalize(&self) {
        let (postponed, dropped) = {
            let mut state = self.state.lock();
            let postponed = state
                .non_greedy
                .as_mut()
                .map(|non_greedy| non_greedy.postponed.drain_all())
                .unwrap_or_default();
            let dropped = state.messages.len();
            state.messages.clear();
            Self::credit(&mut state, dropped);
            (postponed, dropped)
        };

        let released = postponed.len();
        let errors = release_postponed(postponed, self.id);

        let status = {
            let mut state = self.state.lock();
            state.completion.add_faults(errors);
            state.completion.take_status()
        };

        let details = format!("released={released} dropped={dropped} status={status:?}");
        log_block_operation(
            events::BLOCK_COMPLETED,
            block_kinds::BATCH,
            &self.name,
            if status.is_ran_to_completion() { "ok" } else { "error" },
            Some(&details),
        );
        self.publisher.complete(status);
    }

    /// Reserve postponed messages for a whole batch, then consume them all
    fn retrieve_postponed_non_greedy(&self) -> Result<bool> {
        let (candidates, wanted, accept_fewer) = {
            let mut state = self.state.lock();
            if state.completion.is_declining() || state.batches_completed >= self.max_groups {
                return Ok(false);
            }

            let needed = self.batch_size.saturating_sub(state.messages.len());
            let room = state
                .bounding
                .map_or(needed, |bounding| bounding.available().min(needed));
            let Some(non_greedy) = state.non_greedy.as_mut() else {
                return Ok(false);
            };
            let accept_fewer = non_greedy.accept_fewer;

            if room == 0 || non_greedy.postponed.is_empty() {
                return Ok(false);
            }
            if !accept_fewer && (room < needed || non_greedy.postponed.len() < needed) {
                return Ok(false);
            }

            let take = room.min(non_greedy.postponed.len());
            let candidates: Vec<_> = (0..take)
                .filter_map(|_| non_greedy.postponed.pop())
                .collect();
            (candidates, room, accept_fewer)
        };

        let mut reserved = Vec::with_capacity(wanted);
        for candidate in candidates {
            self.reserve_candidate(candidate, &mut reserved)?;
        }
        while reserved.len() < wanted {
            let next = self
                .state
                .lock()
                .non_greedy
                .as_mut()
                .and_then(|non_greedy| non_greedy.postponed.pop());
            let Some(candidate) = next else {
                break;
            };
            self.reserve_candidate(candidate, &mut reserved)?;
        }

        let enough = if accept_fewer {
            !reserved.is_empty()
        } else {
            reserved.len() >= wanted
        };
        if !enough {
            debug!(
                block = %self.name,
                reserved = reserved.len(),
                wanted = wanted,
                "🔓 BATCH: too few reservations, releasing"
            );
            self.release_all(reserved)?;
            return Ok(false);
        }

        {
            let mut state = self.state.lock();
            if state.batches_completed.saturating_add(1) >= self.max_groups {
                self.decline(&mut state, "last permitted batch");
            }
        }

        let mut values = Vec::with_capacity(reserved.len());
        let mut pending = reserved.into_iter();
        while let Some(message) = pending.next() {
            let detail = match message.source.consume(message.header, self.id) {
                Ok(Some(value)) => {
                    values.push(value);
                    continue;
                }
                Ok(None) => "message no longer available".to_string(),
                Err(error) => error.to_string(),
            };

            error!(
                block = %self.name,
                header = %message.header,
                detail = %detail,
                "❌ BATCH: reserved message could not be consumed"
            );
            let violation = DataflowError::ProtocolViolation(format!(
                "source failed to deliver reserved message {}: {detail}",
                message.header
            ));
            return Err(self.release_after_failure(pending.collect(), violation));
        }

        let publish = {
            let mut state = self.state.lock();
            if state.completion.canceled_or_faulted() {
                return Ok(false);
            }
            if let Some(bounding) = state.bounding.as_mut() {
                bounding.charge(values.len());
            }
            state.messages.extend(values);
            let made = self.make_batch_if_possible(&mut state, accept_fewer);
            if made {
                if let Some(non_greedy) = state.non_greedy.as_mut() {
                    non_greedy.accept_fewer = false;
                }
            }
            made
        };
        if publish {
            self.publisher.publish();
        }
        Ok(true)
    }

    /// Bounded-greedy: consume postponed messages directly while there is room
    fn retrieve_postponed_greedy(&self) -> Result<bool> {
        let candidates = {
            let mut state = self.state.lock();
            if state.completion.is_declining() {
                return Ok(false);
            }

            let accept_fewer = state
                .non_greedy
                .as_mut()
                .is_some_and(|non_greedy| std::mem::replace(&mut non_greedy.accept_fewer, false));
            if accept_fewer && self.make_batch_if_possible(&mut state, true) {
                drop(state);
                self.publisher.publish();
                return Ok(true);
            }

            let needed = self.batch_size.saturating_sub(state.messages.len());
            let room = state
                .bounding
                .map_or(needed, |bounding| bounding.available().min(needed));
            let Some(non_greedy) = state.non_greedy.as_mut() else {
                return Ok(false);
            };
            let take = room.min(non_greedy.postponed.len());
            let candidates: Vec<PostponedMessage<T>> = (0..take)
                .filter_map(|_| non_greedy.postponed.pop())
                .collect();
            candidates
        };
        if candidates.is_empty() {
            return Ok(false);
        }

        let mut values = Vec::with_capacity(candidates.len());
        let mut failure = None;
        for candidate in candidates {
            match candidate.source.consume(candidate.header, self.id) {
                Ok(Some(value)) => values.push(value),
                Ok(None) => debug!(
                    block = %self.name,
                    header = %candidate.header,
                    "BATCH: postponed message no longer available"
                ),
                Err(error) => {
                    failure = Some(DataflowError::SourceFailure(error.to_string()));
                    break;
                }
            }
        }

        let publish = {
            let mut state = self.state.lock();
            if state.completion.canceled_or_faulted() {
                false
            } else {
                let mut follow_up = FollowUp::none();
                for value in values {
                    follow_up.merge(self.accept_message(&mut state, value, true));
                }
                follow_up.publish
            }
        };
        if publish {
            self.publisher.publish();
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(true),
        }
    }

    fn reserve_candidate(
        &self,
        candidate: PostponedMessage<T>,
        reserved: &mut Vec<PostponedMessage<T>>,
    ) -> Result<()> {
        match candidate.source.reserve(candidate.header, self.id) {
            Ok(true) => {
                reserved.push(candidate);
                Ok(())
            }
            Ok(false) => {
                debug!(
                    block = %self.name,
                    header = %candidate.header,
                    "BATCH: reservation refused"
                );
                Ok(())
            }
            Err(error) => {
                let failure = DataflowError::SourceFailure(error.to_string());
                Err(self.release_after_failure(std::mem::take(reserved), failure))
            }
        }
    }

    /// Release what is still reserved after `failure`. Release errors join the
    /// block's faults and `failure` is handed back unchanged.
    fn release_after_failure(
        &self,
        reserved: Vec<PostponedMessage<T>>,
        failure: DataflowError,
    ) -> DataflowError {
        let errors = release_reservations(reserved, self.id);
        if !errors.is_empty() {
            warn!(
                block = %self.name,
                release_errors = errors.len(),
                failure = %failure,
                "⚠️ BATCH: releases failed while unwinding reservations"
            );
            self.state.lock().completion.add_faults(errors);
        }
        failure
    }

    fn release_all(&self, reserved: Vec<PostponedMessage<T>>) -> Result<()> {
        let mut errors = release_reservations(reserved, self.id).into_iter();
        match errors.next() {
            None => Ok(()),
            Some(first) => {
                self.state.lock().completion.add_faults(errors);
                Err(first)
            }
        }
    }
}

impl<T: Send + 'static> DrainWork for BatchShared<T> {
    fn drain_name(&self) -> &str {
        &self.name
    }

    fn drain_iteration(&self) -> Result<bool> {
        if self.greedy {
            self.retrieve_postponed_greedy()
        } else {
            self.retrieve_postponed_non_greedy()
        }
    }

    fn drain_failed(&self, error: DataflowError) {
        error!(block = %self.name, error = %error, "❌ BATCH: drain failed");
        let follow_up = {
            let mut state = self.state.lock();
            self.complete_locked(&mut state, Some(error), true, true, false)
        };
        // The drain is still in flight here, so finalization waits for
        // drain_quantum_finished.
        if follow_up.publish {
            self.publisher.publish();
        }
    }

    fn drain_quantum_finished(self: Arc<Self>) {
        let follow_up = {
            let mut state = self.state.lock();
            if let Some(non_greedy) = state.non_greedy.as_mut() {
                non_greedy.drain_in_flight = false;
            }
            let mut follow_up = self.process_async_if_necessary(&mut state);
            follow_up.merge(self.complete_if_possible(&mut state));
            follow_up
        };
        self.run_follow_up(follow_up);
    }
}
