//! # System Constants
//!
//! Defaults and lifecycle event names shared by every grouping block.

/// Sentinel for "no limit" on bounded capacity and max groups
pub const UNBOUNDED: i64 = -1;

/// Default number of drain iterations a background quantum may run before
/// it re-submits itself to the scheduler
pub const DEFAULT_MAX_ITERATIONS_PER_DRAIN_STEP: usize = 64;

/// Largest tuple arity supported by join and batched join blocks
pub const MAX_JOIN_ARITY: usize = 7;

/// Block lifecycle events emitted through structured logging
pub mod events {
    pub const BLOCK_CREATED: &str = "block.created";
    pub const BLOCK_DECLINING: &str = "block.declining_permanently";
    pub const BLOCK_COMPLETION_RESERVED: &str = "block.completion_reserved";
    pub const BLOCK_COMPLETED: &str = "block.completed";
    pub const BLOCK_FAULTED: &str = "block.faulted";
    pub const BLOCK_CANCELED: &str = "block.canceled";
    pub const GROUP_EMITTED: &str = "group.emitted";
    pub const DRAIN_RESCHEDULED: &str = "drain.rescheduled";
}

/// Block kinds used as the `kind` field in block logs
pub mod block_kinds {
    pub const BATCH: &str = "batch";
    pub const JOIN: &str = "join";
    pub const BATCHED_JOIN: &str = "batched_join";
}
