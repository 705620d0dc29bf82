//! # Batched Join Block
//!
//! Collects items of N types into N lists and emits `(Vec<T1>, …, Vec<TN>)`
//! once the lists together hold `batch_size` items. Any split across the
//! targets counts: a batch of five may be three items on one target and two
//! on another.
//!
//! Batched joins are greedy and unbounded only. Completing every target
//! completes the block, and items still buffered below the threshold at that
//! point are dropped rather than flushed as an undersized group.

mod target;

pub use target::BatchedJoinTarget;
pub(crate) use target::{BatchedJoinCoordination, BatchedJoinCoordinator, BatchedJoinParticipant};

use super::tuples::BatchedJoinTuple;
use crate::config::GroupingBlockOptions;
use crate::constants::{block_kinds, events};
use crate::coordination::completion::watch_cancellation;
use crate::coordination::{Completion, CompletionSignal, FollowUp, GroupPublisher, OutputBuffer};
use crate::error::{DataflowError, Result};
use crate::logging::log_block_operation;
use crate::messaging::TargetId;
use crate::scheduling::TaskScheduler;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Groups items of several types into one multi-list batch
pub struct BatchedJoinBlock<Types: BatchedJoinTuple> {
    shared: Arc<BatchedJoinShared<Types>>,
}

struct BatchedJoinShared<Types: BatchedJoinTuple> {
    name: String,
    scheduler: Arc<dyn TaskScheduler>,
    core: Mutex<BatchedJoinCoordination>,
    targets: Types::Targets,
    participants: Vec<Arc<dyn BatchedJoinParticipant>>,
    publisher: GroupPublisher<Types::Output>,
    output: Arc<OutputBuffer<Types::Output>>,
    completion: Completion,
}

impl<Types: BatchedJoinTuple> BatchedJoinBlock<Types> {
    /// Create a batched join emitting every `batch_size` items.
    ///
    /// Non-greedy and bounded settings are rejected.
    pub fn new(batch_size: usize, options: GroupingBlockOptions) -> Result<Self> {
        if batch_size == 0 {
            return Err(DataflowError::InvalidBatchSize(batch_size));
        }
        options.settings.validate()?;
        if !options.settings.greedy {
            return Err(DataflowError::InvalidConfiguration(
                "batched join blocks only support greedy mode".to_string(),
            ));
        }
        if options.settings.is_bounded() {
            return Err(DataflowError::InvalidConfiguration(
                "batched join blocks do not support bounded capacity".to_string(),
            ));
        }

        let scheduler = options.resolve_scheduler()?;
        let max_groups = options.settings.max_groups_limit();
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", block_kinds::BATCHED_JOIN, TargetId::new()));

        let output = Arc::new(OutputBuffer::new());
        let signal = CompletionSignal::new();
        let completion = signal.subscribe();
        let publisher = GroupPublisher::new(output.clone(), signal);

        let shared = Arc::new_cyclic(|weak: &Weak<BatchedJoinShared<Types>>| {
            let coordinator: Weak<dyn BatchedJoinCoordinator> = weak.clone();
            let targets = Types::create_batched_targets(&coordinator);
            let participants = Types::batched_participants(&targets);
            BatchedJoinShared {
                name,
                scheduler,
                core: Mutex::new(BatchedJoinCoordination::new(
                    Types::ARITY,
                    batch_size,
                    max_groups,
                )),
                targets,
                participants,
                publisher,
                output,
                completion,
            }
        });

        info!(
            block = %shared.name,
            arity = Types::ARITY,
            batch_size = batch_size,
            event = events::BLOCK_CREATED,
            "🔗 BATCHED JOIN: block created"
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
                shared.complete_core(Some(error.into()));
            }
        }

        Ok(Self { shared })
    }

    pub fn targets(&self) -> &Types::Targets {
        &self.shared.targets
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn batch_size(&self) -> usize {
        self.shared.core.lock().batch_size
    }

    /// Complete every target
    pub fn complete(&self) {
        Types::complete_targets(&self.shared.targets);
    }

    pub fn fault(&self, error: DataflowError) {
        self.shared.complete_core(Some(error));
    }

    pub fn output(&self) -> &Arc<OutputBuffer<Types::Output>> {
        &self.shared.output
    }

    pub fn try_receive(&self) -> Option<Types::Output> {
        self.shared.output.try_receive()
    }

    pub async fn receive(&self) -> Option<Types::Output> {
        self.shared.output.receive().await
    }

    pub fn receive_all(&self) -> Vec<Types::Output> {
        self.shared.output.receive_all()
    }

    pub fn output_count(&self) -> usize {
        self.shared.output.count()
    }

    pub fn completion(&self) -> Completion {
        self.shared.completion.clone()
    }

    pub fn batches_created(&self) -> u64 {
        self.shared.core.lock().batches_created
    }

    /// Items still needed before the next group is emitted
    pub fn remaining_items_in_batch(&self) -> usize {
        self.shared.core.lock().remaining_items_in_batch
    }
}

impl<Types: BatchedJoinTuple> Clone for BatchedJoinBlock<Types> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Types: BatchedJoinTuple> fmt::Debug for BatchedJoinBlock<Types> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchedJoinBlock")
            .field("name", &self.shared.name)
            .field("arity", &Types::ARITY)
            .finish_non_exhaustive()
    }
}

impl<Types: BatchedJoinTuple> BatchedJoinShared<Types> {
    fn decline_all(&self, core: &mut BatchedJoinCoordination, reason: &str) {
        for index in 0..core.target_completed.len() {
            core.complete_target(index);
        }
        if core.completion.decline() {
            debug!(
                block = %self.name,
                reason = reason,
                event = events::BLOCK_DECLINING,
                "🚫 BATCHED JOIN: declining permanently"
            );
        }
    }

    fn dispatch(self: &Arc<Self>, follow_up: FollowUp) {
        if follow_up.publish {
            self.publisher.publish();
        }
        if follow_up.finalize {
            self.schedule_finalize();
        }
    }

    fn complete_core(self: &Arc<Self>, error: Option<DataflowError>) {
        let follow_up = {
            let mut core = self.core.lock();
            self.complete_locked(&mut core, error, true)
        };
        self.dispatch(follow_up);
    }

    fn cancel(self: &Arc<Self>) {
        {
            let mut core = self.core.lock();
            if core.completion.is_completion_reserved() {
                return;
            }
            core.completion.mark_canceled();
        }
        info!(block = %self.name, event = events::BLOCK_CANCELED, "🛑 BATCHED JOIN: canceled");
        self.complete_core(None);
    }

    fn schedule_finalize(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        if let Err(error) = self.scheduler.schedule(Box::new(move || shared.finalize())) {
            warn!(block = %self.name, error = %error, "⚠️ BATCHED JOIN: finalizing inline");
            self.core
                .lock()
                .completion
                .add_faults([DataflowError::from(error)]);
            self.finalize();
        }
    }

    fn finalize(&self) {
        let (dropped, status) = {
            let mut core = self.core.lock();
            let dropped: usize = self
                .participants
                .iter()
                .map(|participant| participant.clear_buffered())
                .sum();
            (dropped, core.completion.take_status())
        };

        if dropped > 0 {
            debug!(
                block = %self.name,
                dropped = dropped,
                "🗑️ BATCHED JOIN: dropping items below the batch threshold"
            );
        }
        let details = format!("dropped={dropped} status={status:?}");
        log_block_operation(
            events::BLOCK_COMPLETED,
            block_kinds::BATCHED_JOIN,
            &self.name,
            if status.is_ran_to_completion() { "ok" } else { "error" },
            Some(&details),
        );
        self.publisher.complete(status);
    }
}

impl<Types: BatchedJoinTuple> BatchedJoinCoordinator for BatchedJoinShared<Types> {
    fn core(&self) -> &Mutex<BatchedJoinCoordination> {
        &self.core
    }

    fn block_name(&self) -> &str {
        &self.name
    }

    fn item_added(&self, core: &mut BatchedJoinCoordination) -> FollowUp {
        core.remaining_items_in_batch = core.remaining_items_in_batch.saturating_sub(1);
        if core.remaining_items_in_batch > 0 {
            return FollowUp::none();
        }

        let group = Types::take_all(&self.targets);
        core.remaining_items_in_batch = core.batch_size;
        core.batches_created += 1;
        debug!(
            block = %self.name,
            batches_created = core.batches_created,
            event = events::GROUP_EMITTED,
            "🔗 BATCHED JOIN: batch emitted"
        );
        self.publisher.enqueue(group);

        let mut follow_up = FollowUp::publish();
        if core.batches_created >= core.max_groups {
            self.decline_all(core, "group quota reached");
            follow_up.merge(self.complete_if_possible(core));
        }
        follow_up
    }

    fn complete_if_possible(&self, core: &mut BatchedJoinCoordination) -> FollowUp {
        if core.completion.is_completion_reserved() || core.in_flight_consumes > 0 {
            return FollowUp::none();
        }
        if core.alive_targets > 0 && !core.completion.canceled_or_faulted() {
            return FollowUp::none();
        }
        if !core.completion.try_reserve_completion() {
            return FollowUp::none();
        }
        debug!(
            block = %self.name,
            event = events::BLOCK_COMPLETION_RESERVED,
            "🔒 BATCHED JOIN: completion reserved"
        );
        FollowUp {
            finalize: true,
            ..FollowUp::default()
        }
    }

    fn complete_locked(
        &self,
        core: &mut BatchedJoinCoordination,
        error: Option<DataflowError>,
        drop_pending: bool,
    ) -> FollowUp {
        if let Some(error) = error {
            let message = error.to_string();
            if core.completion.record_fault(error, false) {
                warn!(
                    block = %self.name,
                    error = %message,
                    event = events::BLOCK_FAULTED,
                    "💥 BATCHED JOIN: fault recorded"
                );
            }
        }
        if drop_pending {
            for participant in &self.participants {
                participant.clear_buffered();
            }
        }
        self.decline_all(core, "completion requested");
        self.complete_if_possible(core)
    }

    fn run_follow_up(self: Arc<Self>, follow_up: FollowUp) {
        self.dispatch(follow_up);
    }
}
