//! # Grouping Blocks
//!
//! - [`BatchBlock`]: fixed-size batches of one message type
//! - [`JoinBlock`]: one item per input, emitted as a tuple
//! - [`BatchedJoinBlock`]: per-input lists emitted once their combined size
//!   reaches the batch size

pub mod batch;
pub mod batched_join;
pub mod join;
pub mod tuples;

pub use batch::BatchBlock;
pub use batched_join::{BatchedJoinBlock, BatchedJoinTarget};
pub use join::{JoinBlock, JoinTarget};
pub use tuples::{BatchedJoinTuple, JoinTuple};
