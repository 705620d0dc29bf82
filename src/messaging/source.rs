//! Source side of the message protocol.
//!
//! Blocks call into sources only with their internal lock released, so a
//! source may re-enter the block (for example by offering again) from any of
//! these methods.

use super::header::MessageHeader;
use super::target::TargetId;
use crate::error::Result;
use std::sync::Arc;

/// A producer that supports two-phase reservation of offered messages
pub trait SourceBlock<T>: Send + Sync {
    /// Lock the message identified by `header` for `target`.
    /// `Ok(false)` means it is gone or reserved by someone else.
    fn reserve(&self, header: MessageHeader, target: TargetId) -> Result<bool>;

    /// Take the message. `Ok(None)` means it is no longer available.
    fn consume(&self, header: MessageHeader, target: TargetId) -> Result<Option<T>>;

    /// Give up a reservation taken with [`SourceBlock::reserve`]
    fn release(&self, header: MessageHeader, target: TargetId) -> Result<()>;
}

pub type SourceHandle<T> = Arc<dyn SourceBlock<T>>;

/// Identity comparison for source handles, ignoring vtable pointers
pub(crate) fn same_source<T>(left: &SourceHandle<T>, right: &SourceHandle<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(left), Arc::as_ptr(right))
}
