#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear
#![allow(private_interfaces)] // Join tuple traits expose crate-internal coordination seams as hidden methods

//! # Tasker Dataflow
//!
//! In-process grouping blocks for message pipelines: producers offer
//! messages, a block accumulates them, and grouped output is emitted as soon
//! as a completion condition holds.
//!
//! ## Blocks
//!
//! - [`BatchBlock`]: fixed-size batches of one type (`Vec<T>`)
//! - [`JoinBlock`]: tuples with one item from each of 2 to 7 typed inputs
//! - [`BatchedJoinBlock`]: per-input lists emitted once their combined size
//!   reaches the batch size
//!
//! ## Consumption Disciplines
//!
//! - **Greedy**: an offered message is taken immediately.
//! - **Non-greedy**: offers are postponed and the block later reserves a
//!   complete group across sources before consuming any of it. A partial
//!   group is never consumed.
//! - **Bounded**: greedy or non-greedy with a cap on items held by the block
//!   and its unconsumed output. Excess offers are postponed until output is
//!   received.
//!
//! ## Runtime Requirements
//!
//! Blocks never spawn threads of their own. Drain steps, finalization and
//! cancellation watchers are submitted to a [`TaskScheduler`]. Unless one is
//! injected with [`GroupingBlockOptions::with_scheduler`], constructors use
//! [`TokioScheduler::current`] and return [`DataflowError::Scheduling`] when
//! called outside a Tokio runtime.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Offer/reserve/consume/release protocol between blocks
//! - [`blocks`] - Batch, join and batched-join blocks
//! - [`coordination`] - Bounding, postponement, completion and drain machinery
//! - [`scheduling`] - Pluggable task scheduler (tokio by default)
//! - [`config`] - Settings, block options and layered configuration loading
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tasker_dataflow::config::GroupingBlockOptions;
//! use tasker_dataflow::messaging::{HeaderSequence, TargetBlock};
//! use tasker_dataflow::BatchBlock;
//!
//! #[tokio::main]
//! async fn main() -> tasker_dataflow::Result<()> {
//!     tasker_dataflow::logging::init_structured_logging();
//!
//!     let batch = BatchBlock::new(3, GroupingBlockOptions::default())?;
//!     let headers = HeaderSequence::new();
//!     for letter in ['A', 'B', 'C', 'D', 'E', 'F', 'G'] {
//!         batch.offer(headers.next_header(), letter, None, false)?;
//!     }
//!     batch.complete();
//!
//!     while let Some(group) = batch.receive().await {
//!         println!("{group:?}");
//!     }
//!     println!("{:?}", batch.completion().wait().await);
//!     Ok(())
//! }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests
//! ```

pub mod blocks;
pub mod config;
pub mod constants;
pub mod coordination;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod scheduling;

pub use blocks::{
    BatchBlock, BatchedJoinBlock, BatchedJoinTarget, BatchedJoinTuple, JoinBlock, JoinTarget,
    JoinTuple,
};
pub use config::{ConfigManager, GroupingBlockOptions, GroupingSettings};
pub use coordination::{Completion, CompletionStatus, OutputBuffer};
pub use error::{AggregateFault, DataflowError, Result};
pub use messaging::{
    HeaderSequence, MessageHeader, OfferStatus, SourceBlock, SourceHandle, TargetBlock, TargetId,
};
pub use scheduling::{TaskScheduler, TokioScheduler};
