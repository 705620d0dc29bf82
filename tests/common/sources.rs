//! Scripted source for driving the reservation protocol from tests.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tasker_dataflow::{
    DataflowError, HeaderSequence, MessageHeader, OfferStatus, SourceBlock, SourceHandle,
    TargetBlock, TargetId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCall {
    Reserve(MessageHeader),
    Consume(MessageHeader),
    Release(MessageHeader),
}

#[derive(Debug)]
struct SourceState<T> {
    available: HashMap<MessageHeader, T>,
    reserved: HashMap<MessageHeader, TargetId>,
    calls: Vec<SourceCall>,
    refuse_reserve: HashSet<MessageHeader>,
    fail_consume: HashSet<MessageHeader>,
    fail_release: bool,
}

/// In-memory source recording every reserve/consume/release call.
///
/// Messages stay available until consumed, or until a target takes the value
/// directly from an offer.
#[derive(Debug)]
pub struct TestSource<T> {
    name: String,
    headers: HeaderSequence,
    state: Mutex<SourceState<T>>,
}

impl<T: Clone + Send + Sync + 'static> TestSource<T> {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            headers: HeaderSequence::new(),
            state: Mutex::new(SourceState {
                available: HashMap::new(),
                reserved: HashMap::new(),
                calls: Vec::new(),
                refuse_reserve: HashSet::new(),
                fail_consume: HashSet::new(),
                fail_release: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(self: &Arc<Self>) -> SourceHandle<T> {
        Arc::clone(self) as SourceHandle<T>
    }

    /// Offer a fresh message to `target`, keeping it available for the
    /// reservation protocol when the target postpones it.
    pub fn offer_to<B>(self: &Arc<Self>, target: &B, value: T) -> (MessageHeader, OfferStatus)
    where
        B: TargetBlock<T> + ?Sized,
    {
        self.offer_with(target, value, false)
    }

    pub fn offer_with<B>(
        self: &Arc<Self>,
        target: &B,
        value: T,
        consume_to_accept: bool,
    ) -> (MessageHeader, OfferStatus)
    where
        B: TargetBlock<T> + ?Sized,
    {
        let header = self.headers.next_header();
        self.state.lock().available.insert(header, value.clone());

        let status = target
            .offer(header, value, Some(self.handle()), consume_to_accept)
            .expect("offer should not be rejected as an argument error");

        if matches!(status, OfferStatus::Accepted) && !consume_to_accept {
            self.state.lock().available.remove(&header);
        }
        if matches!(status, OfferStatus::Declined | OfferStatus::DecliningPermanently) {
            self.state.lock().available.remove(&header);
        }
        (header, status)
    }

    pub fn refuse_reservation(&self, header: MessageHeader) {
        self.state.lock().refuse_reserve.insert(header);
    }

    pub fn fail_consume(&self, header: MessageHeader) {
        self.state.lock().fail_consume.insert(header);
    }

    pub fn fail_releases(&self) {
        self.state.lock().fail_release = true;
    }

    /// Make a message vanish, as if another target took it
    pub fn withdraw(&self, header: MessageHeader) {
        self.state.lock().available.remove(&header);
    }

    pub fn calls(&self) -> Vec<SourceCall> {
        self.state.lock().calls.clone()
    }

    pub fn consumed(&self) -> Vec<MessageHeader> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SourceCall::Consume(header) => Some(header),
                _ => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<MessageHeader> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SourceCall::Release(header) => Some(header),
                _ => None,
            })
            .collect()
    }

    pub fn outstanding_reservations(&self) -> usize {
        self.state.lock().reserved.len()
    }

    pub fn available_count(&self) -> usize {
        self.state.lock().available.len()
    }
}

impl<T: Clone + Send + Sync + 'static> SourceBlock<T> for TestSource<T> {
    fn reserve(&self, header: MessageHeader, target: TargetId) -> tasker_dataflow::Result<bool> {
        let mut state = self.state.lock();
        state.calls.push(SourceCall::Reserve(header));
        if state.refuse_reserve.contains(&header)
            || !state.available.contains_key(&header)
            || state.reserved.contains_key(&header)
        {
            return Ok(false);
        }
        state.reserved.insert(header, target);
        Ok(true)
    }

    fn consume(
        &self,
        header: MessageHeader,
        target: TargetId,
    ) -> tasker_dataflow::Result<Option<T>> {
        let mut state = self.state.lock();
        state.calls.push(SourceCall::Consume(header));
        if state.fail_consume.contains(&header) {
            return Err(DataflowError::fault(format!("{} refused to deliver {header}", self.name)));
        }
        if let Some(holder) = state.reserved.get(&header) {
            if *holder != target {
                return Ok(None);
            }
        }
        state.reserved.remove(&header);
        Ok(state.available.remove(&header))
    }

    fn release(&self, header: MessageHeader, target: TargetId) -> tasker_dataflow::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(SourceCall::Release(header));
        if state.fail_release {
            return Err(DataflowError::fault(format!("{} failed to release {header}", self.name)));
        }
        match state.reserved.get(&header) {
            Some(holder) if *holder == target => {
                state.reserved.remove(&header);
                Ok(())
            }
            _ => Err(DataflowError::ProtocolViolation(format!(
                "{header} was not reserved by the releasing target"
            ))),
        }
    }
}
