//! Target side of the message protocol.

use super::header::MessageHeader;
use super::source::SourceHandle;
use crate::error::{DataflowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Outcome of offering a message to a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferStatus {
    /// The target took the message; the offering source gives it up
    Accepted,
    /// The target does not want the message now or later
    Declined,
    /// The target remembered (source, header) and may reserve it later
    Postponed,
    /// A consume-to-accept offer could not be consumed from the source
    NotAvailable,
    /// The target will decline every future offer
    DecliningPermanently,
}

impl OfferStatus {
    pub fn is_accepted(self) -> bool {
        matches!(self, OfferStatus::Accepted)
    }
}

/// Identity a target presents to sources when reserving or consuming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(Uuid);

impl TargetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block that accepts messages from producers
pub trait TargetBlock<T>: Send + Sync {
    fn id(&self) -> TargetId;

    /// Offer one message.
    ///
    /// With `consume_to_accept`, `value` is advisory: the target consumes the
    /// message from `source` before accepting it.
    fn offer(
        &self,
        header: MessageHeader,
        value: T,
        source: Option<SourceHandle<T>>,
        consume_to_accept: bool,
    ) -> Result<OfferStatus>;

    /// Signal that no more messages will be offered. Idempotent.
    fn complete(&self);

    /// Complete the target in a faulted state
    fn fault(&self, error: DataflowError);
}

/// Argument checks shared by every `offer` implementation
pub(crate) fn validate_offer(
    header: MessageHeader,
    has_source: bool,
    consume_to_accept: bool,
) -> Result<()> {
    if !header.is_valid() {
        return Err(DataflowError::InvalidMessageHeader(header.id()));
    }
    if consume_to_accept && !has_source {
        return Err(DataflowError::MissingSource);
    }
    Ok(())
}
