//! Batch block behavior through the public target/source protocol.

mod common;

use common::*;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tasker_dataflow::config::GroupingBlockOptions;
use tasker_dataflow::{
    BatchBlock, CompletionStatus, DataflowError, MessageHeader, OfferStatus, SourceBlock,
    SourceHandle, TargetBlock, TargetId,
};
use tokio_util::sync::CancellationToken;

fn offer_plain<T: Send + 'static>(block: &BatchBlock<T>, id: u64, value: T) -> OfferStatus {
    block
        .offer(MessageHeader::new(id), value, None, false)
        .expect("valid offer")
}

#[tokio::test]
async fn test_seven_letters_in_batches_of_three() {
    let batch = BatchBlock::new(3, GroupingBlockOptions::default()).unwrap();
    for (id, letter) in ('A'..='G').enumerate() {
        assert_eq!(offer_plain(&batch, id as u64 + 1, letter), OfferStatus::Accepted);
    }
    assert_eq!(batch.output_count(), 2);
    batch.complete();

    let status = within_timeout(batch.completion().wait()).await;
    assert!(status.is_ran_to_completion());
    assert_eq!(
        batch.receive_all(),
        vec![vec!['A', 'B', 'C'], vec!['D', 'E', 'F'], vec!['G']]
    );
    assert_eq!(batch.batches_completed(), 3);
}

#[tokio::test]
async fn test_complete_is_idempotent() {
    let batch = BatchBlock::new(2, GroupingBlockOptions::default()).unwrap();
    offer_plain(&batch, 1, 10);
    batch.complete();
    batch.complete();

    let status = within_timeout(batch.completion().wait()).await;
    assert!(status.is_ran_to_completion());
    batch.complete();

    assert_eq!(offer_plain(&batch, 2, 11), OfferStatus::DecliningPermanently);
    assert_eq!(batch.receive_all(), vec![vec![10]]);
    assert_eq!(within_timeout(batch.receive()).await, None);
}

#[tokio::test]
async fn test_single_group_quota_declines_further_offers() {
    let options = GroupingBlockOptions::default().with_max_groups(1);
    let batch = BatchBlock::new(2, options).unwrap();

    assert_eq!(offer_plain(&batch, 1, "a"), OfferStatus::Accepted);
    assert_eq!(offer_plain(&batch, 2, "b"), OfferStatus::Accepted);
    assert_eq!(offer_plain(&batch, 3, "c"), OfferStatus::DecliningPermanently);

    let status = within_timeout(batch.completion().wait()).await;
    assert!(status.is_ran_to_completion());
    assert_eq!(batch.receive_all(), vec![vec!["a", "b"]]);
}

#[tokio::test]
async fn test_trigger_batch_emits_undersized_group() {
    let batch = BatchBlock::new(5, GroupingBlockOptions::default()).unwrap();
    offer_plain(&batch, 1, 1u8);
    offer_plain(&batch, 2, 2u8);
    batch.trigger_batch();

    assert_eq!(batch.try_receive(), Some(vec![1, 2]));
    offer_plain(&batch, 3, 3u8);
    assert_eq!(batch.try_receive(), None);
}

#[tokio::test]
async fn test_non_greedy_forms_group_only_when_all_reserved() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_greedy(false)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(3, options).unwrap();

    let sources: Vec<_> = ["a", "b", "c"].into_iter().map(TestSource::new).collect();
    let (_, first) = sources[0].offer_to(&batch, 1u32);
    let (_, second) = sources[1].offer_to(&batch, 2u32);
    assert_eq!(first, OfferStatus::Postponed);
    assert_eq!(second, OfferStatus::Postponed);
    assert_eq!(scheduler.pending(), 0, "two postponed messages cannot fill a batch");

    sources[2].offer_to(&batch, 3u32);
    assert_eq!(batch.postponed_count(), 3);
    scheduler.run_all();

    assert_eq!(batch.try_receive(), Some(vec![1, 2, 3]));
    for source in &sources {
        assert_eq!(source.consumed().len(), 1);
        assert!(source.released().is_empty());
        assert_eq!(source.outstanding_reservations(), 0);
    }
}

#[tokio::test]
async fn test_non_greedy_refused_reservation_releases_the_rest() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_greedy(false)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(3, options).unwrap();

    let a = TestSource::new("a");
    let b = TestSource::new("b");
    let c = TestSource::new("c");
    let (header_a, _) = a.offer_to(&batch, 1u32);
    let (header_b, _) = b.offer_to(&batch, 2u32);
    b.refuse_reservation(header_b);
    let (header_c, _) = c.offer_to(&batch, 3u32);
    scheduler.run_all();

    assert_eq!(batch.output_count(), 0);
    for source in [&a, &b, &c] {
        assert!(source.consumed().is_empty(), "{} must not be consumed", source.name());
        assert_eq!(source.outstanding_reservations(), 0);
    }
    assert_eq!(a.released(), vec![header_a]);
    assert_eq!(c.released(), vec![header_c]);
    assert!(b.released().is_empty());
}

#[tokio::test]
async fn test_non_greedy_consume_failure_faults_block() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_greedy(false)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(2, options).unwrap();

    let a = TestSource::new("a");
    let b = TestSource::new("b");
    a.offer_to(&batch, 1u32);
    let (header_b, _) = b.offer_to(&batch, 2u32);
    b.fail_consume(header_b);
    scheduler.run_all();

    let status = batch.completion().status().expect("block finalized");
    let fault = status.fault().expect("faulted");
    assert!(matches!(
        fault.first(),
        Some(DataflowError::ProtocolViolation(_))
    ));
    assert_eq!(batch.output_count(), 0);
    assert_eq!(
        offer_plain_with_source(&batch, &a, 5),
        OfferStatus::DecliningPermanently
    );
}

fn offer_plain_with_source(
    batch: &BatchBlock<u32>,
    source: &Arc<TestSource<u32>>,
    value: u32,
) -> OfferStatus {
    source.offer_to(batch, value).1
}

#[tokio::test]
async fn test_postponed_drain_order_newest_per_source_then_fifo() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_greedy(false)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(2, options).unwrap();

    let first = TestSource::new("first");
    let second = TestSource::new("second");
    let (stale, _) = first.offer_to(&batch, "first-old");
    let (fresh, _) = first.offer_to(&batch, "first-new");
    assert_eq!(batch.postponed_count(), 1);
    second.offer_to(&batch, "second");
    scheduler.run_all();

    assert_eq!(batch.try_receive(), Some(vec!["first-new", "second"]));
    assert_eq!(first.consumed(), vec![fresh]);
    assert!(!first.consumed().contains(&stale));
}

#[tokio::test]
async fn test_bounded_greedy_holds_at_most_capacity() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_bounded_capacity(4)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(2, options).unwrap();

    let sources: Vec<_> = (0..10).map(|i| TestSource::new(format!("s{i}"))).collect();
    for (value, source) in sources.iter().enumerate() {
        source.offer_to(&batch, value);
        assert!(batch.bounded_count().unwrap() <= 4);
    }
    assert_eq!(batch.output_count(), 2);
    assert_eq!(batch.postponed_count(), 6);

    let mut received = Vec::new();
    while received.len() < 5 {
        let group = batch.try_receive().expect("a batch is ready");
        assert!(batch.bounded_count().unwrap() <= 4);
        received.push(group);
        scheduler.run_all();
        assert!(batch.bounded_count().unwrap() <= 4);
    }

    let flattened: Vec<usize> = received.into_iter().flatten().collect();
    assert_eq!(flattened, (0..10).collect::<Vec<_>>());
    assert_eq!(batch.bounded_count(), Some(0));
    for source in &sources {
        assert_eq!(source.available_count(), 0);
    }
}

#[tokio::test]
async fn test_bounded_capacity_below_batch_size_is_rejected() {
    let options = GroupingBlockOptions::default().with_bounded_capacity(2);
    let error = BatchBlock::<u8>::new(3, options).unwrap_err();
    assert!(error.is_argument_error());
    assert!(matches!(
        error,
        DataflowError::BoundedCapacityBelowBatchSize {
            bounded_capacity: 2,
            batch_size: 3
        }
    ));
}

#[tokio::test]
async fn test_consume_to_accept_of_missing_message_is_not_available() {
    let batch = BatchBlock::new(2, GroupingBlockOptions::default()).unwrap();
    let source = TestSource::<u32>::new("empty");

    let status = batch
        .offer(MessageHeader::new(42), 7, Some(source.handle()), true)
        .unwrap();
    assert_eq!(status, OfferStatus::NotAvailable);

    let (_, status) = source.offer_with(&batch, 8, true);
    assert_eq!(status, OfferStatus::Accepted);
    assert_eq!(source.consumed().len(), 2);
}

#[tokio::test]
async fn test_cancellation_drops_partial_batch() {
    let token = CancellationToken::new();
    let options = GroupingBlockOptions::default().with_cancellation(token.clone());
    let batch = BatchBlock::new(3, options).unwrap();
    offer_plain(&batch, 1, 'x');
    offer_plain(&batch, 2, 'y');

    token.cancel();
    let status = within_timeout(batch.completion().wait()).await;
    assert!(status.is_canceled());
    assert_eq!(within_timeout(batch.receive()).await, None);
    assert_eq!(offer_plain(&batch, 3, 'z'), OfferStatus::DecliningPermanently);
}

#[tokio::test]
async fn test_already_canceled_token_completes_immediately() {
    let token = CancellationToken::new();
    token.cancel();
    let options = GroupingBlockOptions::default().with_cancellation(token);
    let batch = BatchBlock::<u8>::new(1, options).unwrap();

    let status = within_timeout(batch.completion().wait()).await;
    assert!(matches!(status, CompletionStatus::Canceled));
}

#[tokio::test]
async fn test_release_failures_are_aggregated_with_fault() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_greedy(false)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(2, options).unwrap();

    let source = TestSource::new("flaky");
    source.fail_releases();
    source.offer_to(&batch, 1u32);

    batch.fault(DataflowError::fault("upstream broke"));
    scheduler.run_all();

    let status = batch.completion().status().expect("block finalized");
    let fault = status.fault().expect("faulted");
    assert_eq!(fault.len(), 2);
    assert!(matches!(fault.errors()[0], DataflowError::Fault(_)));
    assert!(fault.to_string().starts_with("2 error(s) occurred"));
}

#[tokio::test]
async fn test_rejected_finalization_runs_inline_and_faults() {
    let options = GroupingBlockOptions::default().with_scheduler(Arc::new(RejectingScheduler));
    let batch = BatchBlock::new(2, options).unwrap();
    offer_plain(&batch, 1, 1u16);
    batch.complete();

    let status = batch.completion().status().expect("finalized inline");
    let fault = status.fault().expect("scheduling failure recorded");
    assert!(matches!(fault.first(), Some(DataflowError::Scheduling(_))));
    assert_eq!(batch.receive_all(), vec![vec![1]]);
}

#[tokio::test]
async fn test_invalid_header_leaves_block_untouched() {
    let batch = BatchBlock::new(1, GroupingBlockOptions::default()).unwrap();
    let error = batch
        .offer(MessageHeader::new(0), 1u8, None, false)
        .unwrap_err();
    assert!(matches!(error, DataflowError::InvalidMessageHeader(0)));

    assert_eq!(offer_plain(&batch, 1, 2u8), OfferStatus::Accepted);
    assert_eq!(batch.try_receive(), Some(vec![2]));
}

/// Source that offers a second message into the block while the block is
/// still consuming its first one. A failing source offers the second message
/// plainly and then fails the first consume.
struct ReentrantSource {
    this: Weak<ReentrantSource>,
    block: Mutex<Option<BatchBlock<u32>>>,
    nested_status: Mutex<Option<OfferStatus>>,
    fail: bool,
}

impl ReentrantSource {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            block: Mutex::new(None),
            nested_status: Mutex::new(None),
            fail,
        })
    }

    fn handle(&self) -> SourceHandle<u32> {
        self.this.upgrade().expect("source alive") as SourceHandle<u32>
    }
}

impl SourceBlock<u32> for ReentrantSource {
    fn reserve(&self, _header: MessageHeader, _target: TargetId) -> tasker_dataflow::Result<bool> {
        Ok(true)
    }

    fn consume(
        &self,
        header: MessageHeader,
        _target: TargetId,
    ) -> tasker_dataflow::Result<Option<u32>> {
        if header.id() == 1 {
            let block = self.block.lock().take();
            if let Some(block) = block {
                let status = if self.fail {
                    block.offer(MessageHeader::new(2), 10, None, false)?
                } else {
                    block.offer(MessageHeader::new(2), 0, Some(self.handle()), true)?
                };
                *self.nested_status.lock() = Some(status);
            }
            if self.fail {
                return Err(DataflowError::fault(format!("lost {header}")));
            }
        }
        Ok(Some(header.id() as u32))
    }

    fn release(&self, _header: MessageHeader, _target: TargetId) -> tasker_dataflow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_group_quota_holds_with_reentrant_consume_to_accept() {
    let options = GroupingBlockOptions::default().with_max_groups(1);
    let batch = BatchBlock::new(1, options).unwrap();
    let source = ReentrantSource::new(false);
    *source.block.lock() = Some(batch.clone());

    let status = batch
        .offer(MessageHeader::new(1), 0, Some(source.handle()), true)
        .unwrap();
    assert_eq!(status, OfferStatus::Accepted);
    assert_eq!(*source.nested_status.lock(), Some(OfferStatus::Accepted));

    let completion = within_timeout(batch.completion().wait()).await;
    assert!(completion.is_ran_to_completion());
    assert_eq!(batch.receive_all(), vec![vec![2]]);
    assert_eq!(batch.batches_completed(), 1);
}

#[tokio::test]
async fn test_consume_to_accept_failure_faults_declining_block() {
    let options = GroupingBlockOptions::default().with_max_groups(1);
    let batch = BatchBlock::new(1, options).unwrap();
    let source = ReentrantSource::new(true);
    *source.block.lock() = Some(batch.clone());

    let status = batch
        .offer(MessageHeader::new(1), 0, Some(source.handle()), true)
        .unwrap();
    assert_eq!(status, OfferStatus::NotAvailable);
    assert_eq!(*source.nested_status.lock(), Some(OfferStatus::Accepted));

    let completion = within_timeout(batch.completion().wait()).await;
    let fault = completion.fault().expect("source failure recorded");
    assert!(matches!(fault.first(), Some(DataflowError::SourceFailure(_))));
    assert_eq!(batch.receive_all(), vec![vec![10]]);
}

#[tokio::test]
async fn test_release_failure_keeps_protocol_violation() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_greedy(false)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(3, options).unwrap();

    let a = TestSource::new("a");
    let b = TestSource::new("b");
    let c = TestSource::new("c");
    a.offer_to(&batch, 1u32);
    let (header_b, _) = b.offer_to(&batch, 2u32);
    b.fail_consume(header_b);
    c.fail_releases();
    c.offer_to(&batch, 3u32);
    scheduler.run_all();

    let status = batch.completion().status().expect("block finalized");
    let fault = status.fault().expect("faulted");
    assert_eq!(fault.len(), 2);
    assert!(fault
        .errors()
        .iter()
        .any(|error| matches!(error, DataflowError::ProtocolViolation(_))));
    assert!(fault
        .errors()
        .iter()
        .any(|error| matches!(error, DataflowError::Fault(_))));
    assert_eq!(c.released().len(), 1);
    assert_eq!(batch.output_count(), 0);
}

#[tokio::test]
async fn test_drain_step_budget_forms_one_group_per_quantum() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_greedy(false)
        .with_max_iterations_per_drain_step(1)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(2, options).unwrap();

    let sources: Vec<_> = (0..6).map(|i| TestSource::new(format!("s{i}"))).collect();
    for (value, source) in sources.iter().enumerate() {
        assert_eq!(source.offer_to(&batch, value).1, OfferStatus::Postponed);
    }
    assert_eq!(scheduler.pending(), 1);

    assert!(scheduler.run_one());
    assert_eq!(batch.output_count(), 1);
    assert_eq!(scheduler.pending(), 1, "the next quantum is queued");

    scheduler.run_all();
    assert_eq!(
        batch.receive_all(),
        vec![vec![0, 1], vec![2, 3], vec![4, 5]]
    );
    assert_eq!(batch.postponed_count(), 0);
}

#[tokio::test]
async fn test_non_greedy_trigger_batch_takes_fewer_reservations() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_greedy(false)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(3, options).unwrap();

    let a = TestSource::new("a");
    let b = TestSource::new("b");
    a.offer_to(&batch, 1u32);
    b.offer_to(&batch, 2u32);
    assert_eq!(scheduler.pending(), 0);

    batch.trigger_batch();
    scheduler.run_all();

    assert_eq!(batch.try_receive(), Some(vec![1, 2]));
    for source in [&a, &b] {
        assert_eq!(source.consumed().len(), 1);
        assert_eq!(source.outstanding_reservations(), 0);
    }
    assert_eq!(batch.postponed_count(), 0);
}

#[tokio::test]
async fn test_bounded_non_greedy_resumes_after_receive() {
    let scheduler = ManualScheduler::new();
    let options = GroupingBlockOptions::default()
        .with_greedy(false)
        .with_bounded_capacity(4)
        .with_scheduler(scheduler.clone());
    let batch = BatchBlock::new(2, options).unwrap();

    let sources: Vec<_> = (0..6).map(|i| TestSource::new(format!("s{i}"))).collect();
    for (value, source) in sources.iter().enumerate() {
        source.offer_to(&batch, value);
    }
    scheduler.run_all();

    assert_eq!(batch.output_count(), 2);
    assert_eq!(batch.bounded_count(), Some(4));
    assert_eq!(batch.postponed_count(), 2);
    assert_eq!(scheduler.pending(), 0, "no room left for another batch");

    assert_eq!(batch.try_receive(), Some(vec![0, 1]));
    assert_eq!(batch.bounded_count(), Some(2));
    scheduler.run_all();

    assert!(batch.bounded_count().unwrap() <= 4);
    assert_eq!(batch.receive_all(), vec![vec![2, 3], vec![4, 5]]);
    assert_eq!(batch.bounded_count(), Some(0));
    for source in &sources {
        assert_eq!(source.consumed().len(), 1);
        assert_eq!(source.outstanding_reservations(), 0);
    }
}

#[test]
fn test_construction_outside_runtime_needs_a_scheduler() {
    let error = BatchBlock::<u8>::new(2, GroupingBlockOptions::default()).unwrap_err();
    assert!(matches!(error, DataflowError::Scheduling(_)));

    let options = GroupingBlockOptions::default().with_scheduler(ManualScheduler::new());
    assert!(BatchBlock::<u8>::new(2, options).is_ok());
}
