//! # Scheduling Module
//!
//! Abstraction over where blocks run their background work: drain quanta,
//! finalization and cancellation watchers.
//!
//! Blocks never spawn directly. Every piece of deferred work goes through a
//! [`TaskScheduler`], so a rejected submission can be turned into a block
//! fault instead of silently losing work.

pub mod tokio_scheduler;

use futures::future::BoxFuture;
use std::fmt;
use thiserror::Error;

pub use tokio_scheduler::TokioScheduler;

/// Synchronous unit of deferred block work
pub type ScheduledWork = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("No async runtime available: {0}")]
    RuntimeUnavailable(String),
    #[error("Scheduler has shut down")]
    ShutDown,
    #[error("Work rejected: {0}")]
    Rejected(String),
}

/// Runs block work off the caller's stack
pub trait TaskScheduler: Send + Sync + fmt::Debug {
    /// Submit synchronous work
    fn schedule(&self, work: ScheduledWork) -> Result<(), SchedulerError>;

    /// Submit a future that should be driven to completion
    fn schedule_future(&self, work: BoxFuture<'static, ()>) -> Result<(), SchedulerError>;
}
