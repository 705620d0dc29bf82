//! # Messaging Module
//!
//! The message protocol every grouping block speaks.
//!
//! - **Targets** ([`TargetBlock`]) receive `offer` / `complete` / `fault`.
//! - **Sources** ([`SourceBlock`]) answer the two-phase `reserve` → `consume`
//!   or `release` commit used by non-greedy and bounded blocks.
//! - **Headers** ([`MessageHeader`]) identify one specific offer for exactly
//!   one reservation cycle.

pub mod header;
pub mod source;
pub mod target;

pub use header::{HeaderSequence, MessageHeader};
pub use source::{SourceBlock, SourceHandle};
pub use target::{OfferStatus, TargetBlock, TargetId};
