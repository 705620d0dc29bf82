//! # Output
//!
//! Ordered hand-off of formed groups to the output sink.
//!
//! Groups are queued under the block lock, in formation order, and delivered
//! after the lock is released by whichever caller becomes the single active
//! publisher. The terminal status travels through the same queue, so the sink
//! always sees it after the last group.

use super::completion::{CompletionSignal, CompletionStatus};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;
use tracing::trace;

/// Receiver of formed groups
pub trait GroupSink<G>: Send + Sync {
    fn add_group(&self, group: G);

    fn complete(&self, status: CompletionStatus);
}

enum Publication<G> {
    Group(G),
    Complete(CompletionStatus),
}

/// Single-publisher ordered delivery into a [`GroupSink`]
pub struct GroupPublisher<G> {
    queue: SegQueue<Publication<G>>,
    publishing: AtomicBool,
    sink: Arc<dyn GroupSink<G>>,
    signal: CompletionSignal,
}

impl<G> GroupPublisher<G> {
    pub fn new(sink: Arc<dyn GroupSink<G>>, signal: CompletionSignal) -> Self {
        Self {
            queue: SegQueue::new(),
            publishing: AtomicBool::new(false),
            sink,
            signal,
        }
    }

    /// Queue a group; call under the block lock so order matches formation
    pub fn enqueue(&self, group: G) {
        self.queue.push(Publication::Group(group));
    }

    /// Queue the terminal status and deliver everything outstanding
    pub fn complete(&self, status: CompletionStatus) {
        self.queue.push(Publication::Complete(status));
        self.publish();
    }

    /// Deliver queued publications. Must be called without the block lock.
    pub fn publish(&self) {
        loop {
            if self
                .publishing
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return;
            }

            while let Some(publication) = self.queue.pop() {
                match publication {
                    Publication::Group(group) => self.sink.add_group(group),
                    Publication::Complete(status) => {
                        self.sink.complete(status.clone());
                        self.signal.resolve(status);
                    }
                }
            }

            self.publishing.store(false, Ordering::Release);
            if self.queue.is_empty() {
                return;
            }
        }
    }
}

impl<G> fmt::Debug for GroupPublisher<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupPublisher")
            .field("queued", &self.queue.len())
            .field("publishing", &self.publishing.load(Ordering::Relaxed))
            .finish()
    }
}

type RemovalHook = Box<dyn Fn(usize) + Send + Sync>;

struct OutputState<G> {
    groups: VecDeque<G>,
    completion: Option<CompletionStatus>,
}

/// Default output sink: buffers groups until a consumer receives them.
///
/// Removals are reported to the owning block (when a hook is installed) with
/// the weight of the removed groups, outside the buffer's lock.
pub struct OutputBuffer<G> {
    state: Mutex<OutputState<G>>,
    available: Notify,
    weigh: fn(&G) -> usize,
    on_removed: OnceLock<RemovalHook>,
}

fn unit_weight<G>(_group: &G) -> usize {
    1
}

impl<G> OutputBuffer<G> {
    /// Every group weighs one
    pub fn new() -> Self {
        Self::with_weigher(unit_weight::<G>)
    }

    pub fn with_weigher(weigh: fn(&G) -> usize) -> Self {
        Self {
            state: Mutex::new(OutputState {
                groups: VecDeque::new(),
                completion: None,
            }),
            available: Notify::new(),
            weigh,
            on_removed: OnceLock::new(),
        }
    }

    /// Install the removal callback. Only the first hook is kept.
    pub fn set_removal_hook(&self, hook: impl Fn(usize) + Send + Sync + 'static) -> bool {
        self.on_removed.set(Box::new(hook)).is_ok()
    }

    pub fn try_receive(&self) -> Option<G> {
        let group = self.state.lock().groups.pop_front()?;
        self.report_removed((self.weigh)(&group));
        Some(group)
    }

    /// Wait for the next group. `None` once the buffer is completed and empty.
    pub async fn receive(&self) -> Option<G> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(group) = state.groups.pop_front() {
                    drop(state);
                    self.report_removed((self.weigh)(&group));
                    return Some(group);
                }
                if state.completion.is_some() {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn receive_all(&self) -> Vec<G> {
        let groups: Vec<G> = self.state.lock().groups.drain(..).collect();
        let weight: usize = groups.iter().map(self.weigh).sum();
        self.report_removed(weight);
        groups
    }

    pub fn count(&self) -> usize {
        self.state.lock().groups.len()
    }

    pub fn completion_status(&self) -> Option<CompletionStatus> {
        self.state.lock().completion.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completion.is_some()
    }

    fn report_removed(&self, weight: usize) {
        if weight == 0 {
            return;
        }
        if let Some(hook) = self.on_removed.get() {
            hook(weight);
        }
    }
}

impl<G> Default for OutputBuffer<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Send> GroupSink<G> for OutputBuffer<G> {
    fn add_group(&self, group: G) {
        self.state.lock().groups.push_back(group);
        trace!("📤 OUTPUT: group buffered");
        self.available.notify_waiters();
    }

    fn complete(&self, status: CompletionStatus) {
        {
            let mut state = self.state.lock();
            if state.completion.is_some() {
                return;
            }
            state.completion = Some(status);
        }
        self.available.notify_waiters();
    }
}

impl<G> fmt::Debug for OutputBuffer<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OutputBuffer")
            .field("count", &state.groups.len())
            .field("completion", &state.completion)
            .finish()
    }
}
