//! # Coordination Module
//!
//! Building blocks shared by every grouping block:
//!
//! - **bounding**: capacity accounting for bounded blocks
//! - **postponed**: per-source postponed offers and their release
//! - **completion**: the decline / reserve / finalize state machine
//! - **drain**: the iteration-bounded background retrieval loop
//! - **output**: ordered group publication and the default output buffer

pub mod bounding;
pub mod completion;
pub mod drain;
pub mod output;
pub mod postponed;

pub use bounding::BoundingState;
pub use completion::{Completion, CompletionSignal, CompletionState, CompletionStatus, FollowUp};
pub use drain::{DrainWork, QuantumOutcome};
pub use output::{GroupPublisher, GroupSink, OutputBuffer};
pub use postponed::{PostponedMessage, PostponedMessages};
