//! # Join Block
//!
//! Joins N independent inputs into tuples `(T1, …, TN)`, N from 2 to 7.
//! A tuple is formed as soon as every position holds at least one item.
//!
//! ## Modes
//!
//! - **Greedy**: each target buffers what it is offered; the tuple forms
//!   synchronously inside the offer that completes it.
//! - **Bounded-greedy**: as greedy while the formed-and-unconsumed tuples
//!   plus the rows being assembled fit the capacity. The backlog is drained
//!   without reservation, and a target holding strictly more items than every
//!   sibling waits so a fast producer cannot starve a slow one.
//! - **Non-greedy**: every offer is postponed. The drain loop reserves one
//!   message per missing position and consumes them only when all
//!   reservations succeed, so partial tuples never leave a source.
//!
//! Released reservations are not remembered; the source is expected to offer
//! the message again.
//!
//! ```rust,no_run
//! use tasker_dataflow::blocks::JoinBlock;
//! use tasker_dataflow::config::GroupingBlockOptions;
//! use tasker_dataflow::messaging::{MessageHeader, TargetBlock};
//!
//! #[tokio::main]
//! async fn main() -> tasker_dataflow::Result<()> {
//!     let join = JoinBlock::<(u32, String)>::new(GroupingBlockOptions::default())?;
//!     let (numbers, names) = join.targets();
//!     numbers.offer(MessageHeader::new(1), 7, None, false)?;
//!     names.offer(MessageHeader::new(1), "seven".to_string(), None, false)?;
//!
//!     assert_eq!(join.try_receive(), Some((7, "seven".to_string())));
//!     Ok(())
//! }
//! ```

mod target;

pub use target::JoinTarget;
pub(crate) use target::{JoinCoordination, JoinCoordinator, JoinParticipant};

use super::tuples::JoinTuple;
use crate::config::GroupingBlockOptions;
use crate::constants::{block_kinds, events};
use crate::coordination::completion::watch_cancellation;
use crate::coordination::drain::{schedule_drain, DrainWork};
use crate::coordination::{Completion, CompletionSignal, FollowUp, GroupPublisher, OutputBuffer};
use crate::error::{DataflowError, Result};
use crate::logging::log_block_operation;
use crate::messaging::TargetId;
use crate::scheduling::TaskScheduler;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Joins one item from each input into a tuple
pub struct JoinBlock<Out: JoinTuple> {
    shared: Arc<JoinShared<Out>>,
}

struct JoinShared<Out: JoinTuple> {
    name: String,
    max_iterations: usize,
    scheduler: Arc<dyn TaskScheduler>,
    core: Mutex<JoinCoordination>,
    targets: Out::Targets,
    participants: Vec<Arc<dyn JoinParticipant>>,
    publisher: GroupPublisher<Out>,
    output: Arc<OutputBuffer<Out>>,
    completion: Completion,
}

impl<Out: JoinTuple> JoinBlock<Out> {
    pub fn new(options: GroupingBlockOptions) -> Result<Self> {
        options.settings.validate()?;
        let scheduler = options.resolve_scheduler()?;

        let greedy = options.settings.greedy;
        let bounded_capacity = options.settings.bounded_capacity();
        let max_groups = options.settings.max_groups_limit();
        let max_iterations = options.settings.max_iterations_per_drain_step;
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", block_kinds::JOIN, TargetId::new()));

        let output = Arc::new(OutputBuffer::new());
        let signal = CompletionSignal::new();
        let completion = signal.subscribe();
        let publisher = GroupPublisher::new(output.clone(), signal);
        let block_output = output.clone();

        let shared = Arc::new_cyclic(|weak: &Weak<JoinShared<Out>>| {
            let coordinator: Weak<dyn JoinCoordinator> = weak.clone();
            let targets = Out::create_targets(&coordinator);
            let participants = Out::participants(&targets);
            JoinShared {
                name,
                max_iterations,
                scheduler,
                core: Mutex::new(JoinCoordination::new(
                    Out::ARITY,
                    greedy,
                    bounded_capacity,
                    max_groups,
                )),
                targets,
                participants,
                publisher,
                output: block_output,
                completion,
            }
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
            arity = Out::ARITY,
            greedy = greedy,
            bounded_capacity = ?bounded_capacity,
            event = events::BLOCK_CREATED,
            "🔗 JOIN: block created"
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
                shared.complete_core(Some(error.into()), true, false);
            }
        }

        Ok(Self { shared })
    }

    /// One target per tuple position
    pub fn targets(&self) -> &Out::Targets {
        &self.shared.targets
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Complete every target
    pub fn complete(&self) {
        let follow_up = {
            let mut core = self.shared.core.lock();
            core.target_declining.iter_mut().for_each(|declining| *declining = true);
            self.shared.complete_if_possible(&mut core)
        };
        self.shared.dispatch(follow_up);
    }

    pub fn fault(&self, error: DataflowError) {
        self.shared.complete_core(Some(error), true, false);
    }

    pub fn output(&self) -> &Arc<OutputBuffer<Out>> {
        &self.shared.output
    }

    pub fn try_receive(&self) -> Option<Out> {
        self.shared.output.try_receive()
    }

    pub async fn receive(&self) -> Option<Out> {
        self.shared.output.receive().await
    }

    pub fn receive_all(&self) -> Vec<Out> {
        self.shared.output.receive_all()
    }

    pub fn output_count(&self) -> usize {
        self.shared.output.count()
    }

    pub fn completion(&self) -> Completion {
        self.shared.completion.clone()
    }

    pub fn tuples_created(&self) -> u64 {
        self.shared.core.lock().tuples_created
    }

    /// Formed tuples not yet removed from the output, when bounded
    pub fn bounded_count(&self) -> Option<usize> {
        self.shared
            .core
            .lock()
            .bounding
            .map(|bounding| bounding.current())
    }
}

impl<Out: JoinTuple> Clone for JoinBlock<Out> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Out: JoinTuple> fmt::Debug for JoinBlock<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinBlock")
            .field("name", &self.shared.name)
            .field("arity", &Out::ARITY)
            .finish_non_exhaustive()
    }
}

impl<Out: JoinTuple> JoinShared<Out> {
    /// Buffered plus in-flight items per position
    fn counts(&self, core: &JoinCoordination) -> Vec<usize> {
        self.participants
            .iter()
            .map(|participant| participant.buffered() + core.in_flight[participant.index()])
            .collect()
    }

    /// Rows under assembly if `index` gained one item, checked against capacity
    fn room_for_item(&self, core: &JoinCoordination, counts: &[usize], index: usize) -> bool {
        let Some(bounding) = core.bounding else {
            return true;
        };
        let rows = counts
            .iter()
            .enumerate()
            .map(|(position, count)| if position == index { count + 1 } else { *count })
            .max()
            .unwrap_or(1);
        bounding.has_room_for(rows)
    }

    fn try_form_tuple(&self, core: &mut JoinCoordination) -> bool {
        if core.tuples_created >= core.max_groups {
            return false;
        }
        let Some(tuple) = Out::take(&self.targets) else {
            return false;
        };

        core.tuples_created += 1;
        if let Some(bounding) = core.bounding.as_mut() {
            bounding.charge(1);
        }
        debug!(
            block = %self.name,
            tuples_created = core.tuples_created,
            event = events::GROUP_EMITTED,
            "🔗 JOIN: tuple formed"
        );
        self.publisher.enqueue(tuple);
        true
    }

    fn decline_block(&self, core: &mut JoinCoordination, reason: &str) {
        core.target_declining.iter_mut().for_each(|declining| *declining = true);
        if core.completion.decline() {
            debug!(
                block = %self.name,
                reason = reason,
                event = events::BLOCK_DECLINING,
                "🚫 JOIN: declining permanently"
            );
        }
    }

    fn update_target_quotas(&self, core: &mut JoinCoordination) {
        if core.max_groups == u64::MAX {
            return;
        }
        for participant in &self.participants {
            let index = participant.index();
            let obtainable = core.tuples_created + participant.buffered() as u64;
            if !core.target_declining[index] && obtainable >= core.max_groups {
                core.target_declining[index] = true;
                debug!(block = %self.name, position = index, "🚫 JOIN: target reached group quota");
            }
        }
        if core.tuples_created >= core.max_groups {
            self.decline_block(core, "group quota reached");
        }
    }

    /// Some declining target can never contribute another item
    fn any_target_exhausted(&self, core: &JoinCoordination) -> bool {
        self.participants.iter().any(|participant| {
            let index = participant.index();
            core.target_declining[index]
                && core.in_flight[index] == 0
                && participant.buffered() == 0
                && participant.postponed_len() == 0
                && !participant.has_reservation()
        })
    }

    fn has_drain_work(&self, core: &JoinCoordination) -> bool {
        if core.tuples_created >= core.max_groups {
            return false;
        }

        if core.greedy {
            return self.participants.iter().any(|participant| {
                participant.postponed_len() > 0
                    && self.may_consume_postponed(core, participant.index())
            });
        }

        if core.bounding.is_some_and(|bounding| !bounding.has_room()) {
            return false;
        }
        let mut missing_any = false;
        for participant in &self.participants {
            if participant.buffered() == 0 {
                if participant.postponed_len() == 0 {
                    return false;
                }
                missing_any = true;
            }
        }
        missing_any
    }

    fn dispatch(self: &Arc<Self>, follow_up: FollowUp) {
        if follow_up.publish {
            self.publisher.publish();
        }
        if follow_up.start_drain {
            if let Err(error) =
                schedule_drain(self.scheduler.as_ref(), Arc::clone(self), self.max_iterations)
            {
                warn!(block = %self.name, error = %error, "⚠️ JOIN: failed to schedule drain");
                self.complete_core(Some(error.into()), true, true);
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
        revert_processing: bool,
    ) {
        let follow_up = {
            let mut core = self.core.lock();
            if revert_processing {
                core.drain_in_flight = false;
            }
            self.complete_with(&mut core, error, drop_pending, revert_processing)
        };
        self.dispatch(follow_up);
    }

    fn complete_with(
        &self,
        core: &mut JoinCoordination,
        error: Option<DataflowError>,
        drop_pending: bool,
        releasing_reserved: bool,
    ) -> FollowUp {
        if let Some(error) = error {
            let message = error.to_string();
            if core.completion.record_fault(error, releasing_reserved) {
                warn!(
                    block = %self.name,
                    error = %message,
                    event = events::BLOCK_FAULTED,
                    "💥 JOIN: fault recorded"
                );
            }
        }
        if drop_pending {
            for participant in &self.participants {
                participant.clear_buffered();
            }
        }
        self.decline_block(core, "completion requested");
        self.complete_if_possible(core)
    }

    fn cancel(self: &Arc<Self>) {
        {
            let mut core = self.core.lock();
            if core.completion.is_completion_reserved() {
                return;
            }
            core.completion.mark_canceled();
        }
        info!(block = %self.name, event = events::BLOCK_CANCELED, "🛑 JOIN: canceled");
        self.complete_core(None, true, false);
    }

    fn on_items_removed(self: &Arc<Self>, count: usize) {
        let follow_up = {
            let mut core = self.core.lock();
            if let Some(bounding) = core.bounding.as_mut() {
                bounding.credit(count);
            }
            let mut follow_up = self.process_async_if_necessary(&mut core);
            follow_up.merge(self.complete_if_possible(&mut core));
            follow_up
        };
        self.dispatch(follow_up);
    }

    fn schedule_finalize(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        if let Err(error) = self.scheduler.schedule(Box::new(move || shared.finalize())) {
            warn!(block = %self.name, error = %error, "⚠️ JOIN: finalizing inline");
            self.core
                .lock()
                .completion
                .add_faults([DataflowError::from(error)]);
            self.finalize();
        }
    }

    fn finalize(&self) {
        let errors: Vec<DataflowError> = self
            .participants
            .iter()
            .flat_map(|participant| participant.release_all_postponed())
            .collect();

        let (dropped, status) = {
            let mut core = self.core.lock();
            let dropped: usize = self
                .participants
                .iter()
                .map(|participant| participant.clear_buffered())
                .sum();
            core.completion.add_faults(errors);
            (dropped, core.completion.take_status())
        };

        let details = format!("dropped={dropped} status={status:?}");
        log_block_operation(
            events::BLOCK_COMPLETED,
            block_kinds::JOIN,
            &self.name,
            if status.is_ran_to_completion() { "ok" } else { "error" },
            Some(&details),
        );
        self.publisher.complete(status);
    }

    fn release_reservations(&self, reserved: &[Arc<dyn JoinParticipant>]) -> Result<()> {
        let mut errors = reserved
            .iter()
            .filter_map(|participant| participant.release_reserved().err());
        match errors.next() {
            None => Ok(()),
            Some(first) => {
                let rest: Vec<_> = errors.collect();
                self.core.lock().completion.add_faults(rest);
                Err(first)
            }
        }
    }

    /// Release positions still reserved after `failure`, recording release
    /// errors as faults and returning `failure` itself
    fn release_after_failure(
        &self,
        reserved: &[Arc<dyn JoinParticipant>],
        failure: DataflowError,
    ) -> DataflowError {
        let errors: Vec<_> = reserved
            .iter()
            .filter_map(|participant| participant.release_reserved().err())
            .collect();
        if !errors.is_empty() {
            warn!(
                block = %self.name,
                release_errors = errors.len(),
                failure = %failure,
                "⚠️ JOIN: releases failed while unwinding reservations"
            );
            self.core.lock().completion.add_faults(errors);
        }
        failure
    }

    /// Reserve one message per missing position, then consume all or none
    fn retrieve_non_greedy(&self) -> Result<bool> {
        let missing: Vec<Arc<dyn JoinParticipant>> = {
            let core = self.core.lock();
            if core.completion.is_declining() || !self.has_drain_work(&core) {
                return Ok(false);
            }
            self.participants
                .iter()
                .filter(|participant| participant.buffered() == 0)
                .cloned()
                .collect()
        };

        let mut reserved = Vec::with_capacity(missing.len());
        for participant in missing {
            match participant.reserve_one() {
                Ok(true) => reserved.push(participant),
                Ok(false) => {
                    debug!(
                        block = %self.name,
                        position = participant.index(),
                        "🔓 JOIN: position could not be reserved, releasing"
                    );
                    self.release_reservations(&reserved)?;
                    return Ok(false);
                }
                Err(error) => return Err(self.release_after_failure(&reserved, error)),
            }
        }

        {
            let mut core = self.core.lock();
            if core.tuples_created.saturating_add(1) >= core.max_groups {
                self.decline_block(&mut core, "last permitted tuple");
            }
        }

        for (position, participant) in reserved.iter().enumerate() {
            if let Err(error) = participant.consume_reserved(&self.core) {
                error!(
                    block = %self.name,
                    position = participant.index(),
                    error = %error,
                    "❌ JOIN: reserved message could not be consumed"
                );
                return Err(self.release_after_failure(&reserved[position + 1..], error));
            }
        }

        let publish = {
            let mut core = self.core.lock();
            !core.completion.canceled_or_faulted() && self.try_form_tuple(&mut core)
        };
        if publish {
            self.publisher.publish();
        }
        Ok(true)
    }

    /// Bounded-greedy: pull postponed messages directly, honoring the tie-break
    fn retrieve_greedy(&self) -> Result<bool> {
        let mut progressed = false;
        for participant in &self.participants {
            if participant.consume_one_postponed(self)? {
                progressed = true;
            }
        }

        let publish = {
            let mut core = self.core.lock();
            let mut formed = false;
            if !core.completion.canceled_or_faulted() {
                while self.try_form_tuple(&mut core) {
                    formed = true;
                }
            }
            formed
        };
        if publish {
            self.publisher.publish();
        }
        Ok(progressed)
    }
}

impl<Out: JoinTuple> JoinCoordinator for JoinShared<Out> {
    fn core(&self) -> &Mutex<JoinCoordination> {
        &self.core
    }

    fn block_name(&self) -> &str {
        &self.name
    }

    fn can_accept_now(&self, core: &JoinCoordination, index: usize, postponed_empty: bool) -> bool {
        if !core.non_greedy {
            return true;
        }
        if !core.greedy || core.drain_in_flight || !postponed_empty {
            return false;
        }
        let counts = self.counts(core);
        self.room_for_item(core, &counts, index)
    }

    fn may_consume_postponed(&self, core: &JoinCoordination, index: usize) -> bool {
        let counts = self.counts(core);
        let own = counts[index];
        let most_among_siblings = counts
            .iter()
            .enumerate()
            .filter(|(position, _)| *position != index)
            .map(|(_, count)| *count)
            .max()
            .unwrap_or(0);
        if own > most_among_siblings {
            return false;
        }
        self.room_for_item(core, &counts, index)
    }

    fn after_item_buffered(&self, core: &mut JoinCoordination) -> FollowUp {
        let mut follow_up = FollowUp::none();
        if self.try_form_tuple(core) {
            follow_up.publish = true;
        }
        follow_up.merge(self.complete_if_possible(core));
        follow_up
    }

    fn process_async_if_necessary(&self, core: &mut JoinCoordination) -> FollowUp {
        if !core.non_greedy
            || core.drain_in_flight
            || core.completion.is_declining()
            || core.completion.is_completion_reserved()
            || !self.has_drain_work(core)
        {
            return FollowUp::none();
        }
        core.drain_in_flight = true;
        FollowUp {
            start_drain: true,
            ..FollowUp::default()
        }
    }

    fn complete_if_possible(&self, core: &mut JoinCoordination) -> FollowUp {
        self.update_target_quotas(core);
        if core.completion.is_completion_reserved() || core.is_processing() {
            return FollowUp::none();
        }

        if !core.completion.is_declining() {
            let all_declining = core.target_declining.iter().all(|declining| *declining);
            if all_declining || self.any_target_exhausted(core) {
                self.decline_block(core, "no further tuple possible");
            }
        }
        if !core.completion.is_declining() && !core.completion.canceled_or_faulted() {
            return FollowUp::none();
        }

        if !core.completion.try_reserve_completion() {
            return FollowUp::none();
        }
        debug!(
            block = %self.name,
            event = events::BLOCK_COMPLETION_RESERVED,
            "🔒 JOIN: completion reserved"
        );
        FollowUp {
            finalize: true,
            ..FollowUp::default()
        }
    }

    fn complete_locked(
        &self,
        core: &mut JoinCoordination,
        error: Option<DataflowError>,
        drop_pending: bool,
    ) -> FollowUp {
        self.complete_with(core, error, drop_pending, false)
    }

    fn run_follow_up(self: Arc<Self>, follow_up: FollowUp) {
        self.dispatch(follow_up);
    }
}

impl<Out: JoinTuple> DrainWork for JoinShared<Out> {
    fn drain_name(&self) -> &str {
        &self.name
    }

    fn drain_iteration(&self) -> Result<bool> {
        let greedy = self.core.lock().greedy;
        if greedy {
            self.retrieve_greedy()
        } else {
            self.retrieve_non_greedy()
        }
    }

    fn drain_failed(&self, error: DataflowError) {
        error!(block = %self.name, error = %error, "❌ JOIN: drain failed");
        let follow_up = {
            let mut core = self.core.lock();
            self.complete_with(&mut core, Some(error), true, true)
        };
        // Finalization waits for drain_quantum_finished.
        if follow_up.publish {
            self.publisher.publish();
        }
    }

    fn drain_quantum_finished(self: Arc<Self>) {
        let follow_up = {
            let mut core = self.core.lock();
            core.drain_in_flight = false;
            let mut follow_up = self.process_async_if_necessary(&mut core);
            follow_up.merge(self.complete_if_possible(&mut core));
            follow_up
        };
        self.dispatch(follow_up);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{MessageHeader, OfferStatus, TargetBlock};

    #[tokio::test]
    async fn test_greedy_pair_forms_tuple_on_second_item() {
        let join = JoinBlock::<(u32, char)>::new(GroupingBlockOptions::default()).unwrap();
        let (numbers, letters) = join.targets();

        let status = numbers.offer(MessageHeader::new(1), 1, None, false).unwrap();
        assert_eq!(status, OfferStatus::Accepted);
        assert_eq!(join.output_count(), 0);

        letters.offer(MessageHeader::new(1), 'a', None, false).unwrap();
        assert_eq!(join.try_receive(), Some((1, 'a')));
        assert_eq!(join.tuples_created(), 1);
    }

    #[tokio::test]
    async fn test_non_greedy_without_source_declines() {
        let options = GroupingBlockOptions::default().with_greedy(false);
        let join = JoinBlock::<(u32, u32)>::new(options).unwrap();
        let (first, _) = join.targets();
        let status = first.offer(MessageHeader::new(1), 1, None, false).unwrap();
        assert_eq!(status, OfferStatus::Declined);
    }

    #[tokio::test]
    async fn test_completing_one_empty_target_completes_block() {
        let join = JoinBlock::<(u32, u32, u32)>::new(GroupingBlockOptions::default()).unwrap();
        let (first, second, _) = join.targets();
        first.offer(MessageHeader::new(1), 1, None, false).unwrap();
        second.complete();

        assert!(join.completion().wait().await.is_ran_to_completion());
        let status = first.offer(MessageHeader::new(2), 2, None, false).unwrap();
        assert_eq!(status, OfferStatus::DecliningPermanently);
        assert!(join.receive_all().is_empty());
    }

    #[tokio::test]
    async fn test_target_fault_faults_block() {
        let join = JoinBlock::<(u32, u32)>::new(GroupingBlockOptions::default()).unwrap();
        let (first, _) = join.targets();
        first.fault(DataflowError::fault("bad input"));

        let status = join.completion().wait().await;
        assert!(status.is_faulted());
    }
}
