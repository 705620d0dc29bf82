//! Postponed message bookkeeping.
//!
//! One record is kept per source. A newer offer from a source that already
//! has a record replaces the header in place, so the newest header from each
//! source wins. Across sources, records are handed out in the order their
//! source was first postponed.

use crate::error::DataflowError;
use crate::messaging::source::same_source;
use crate::messaging::{MessageHeader, SourceHandle, TargetId};
use std::collections::VecDeque;
use std::fmt;
use tracing::warn;

/// An offer that was not taken immediately
pub struct PostponedMessage<T> {
    pub source: SourceHandle<T>,
    pub header: MessageHeader,
}

impl<T> Clone for PostponedMessage<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            header: self.header,
        }
    }
}

impl<T> fmt::Debug for PostponedMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostponedMessage")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

pub struct PostponedMessages<T> {
    records: VecDeque<PostponedMessage<T>>,
}

impl<T> PostponedMessages<T> {
    pub fn new() -> Self {
        Self {
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, source: SourceHandle<T>, header: MessageHeader) {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|record| same_source(&record.source, &source))
        {
            existing.header = header;
        } else {
            self.records.push_back(PostponedMessage { source, header });
        }
    }

    pub fn pop(&mut self) -> Option<PostponedMessage<T>> {
        self.records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn drain_all(&mut self) -> Vec<PostponedMessage<T>> {
        self.records.drain(..).collect()
    }
}

impl<T> Default for PostponedMessages<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PostponedMessages<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostponedMessages")
            .field("len", &self.records.len())
            .finish()
    }
}

/// Hand postponed messages back to their sources.
///
/// Each one is reserved and then released so the source learns the offer is
/// no longer wanted. Must be called without any block lock held.
pub fn release_postponed<T>(
    messages: Vec<PostponedMessage<T>>,
    target: TargetId,
) -> Vec<DataflowError> {
    let mut errors = Vec::new();
    for message in messages {
        match message.source.reserve(message.header, target) {
            Ok(true) => {
                if let Err(error) = message.source.release(message.header, target) {
                    errors.push(error);
                }
            }
            Ok(false) => {}
            Err(error) => errors.push(error),
        }
    }

    if !errors.is_empty() {
        warn!(
            target_id = %target,
            error_count = errors.len(),
            "📮 POSTPONED: releasing postponed messages failed"
        );
    }
    errors
}

/// Release reservations that will not be consumed
pub fn release_reservations<T>(
    reserved: Vec<PostponedMessage<T>>,
    target: TargetId,
) -> Vec<DataflowError> {
    reserved
        .into_iter()
        .filter_map(|message| message.source.release(message.header, target).err())
        .collect()
}
