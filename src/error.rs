//! # Error Types
//!
//! Structured errors for the grouping blocks.
//!
//! Argument errors (bad headers, missing sources, invalid sizes) are returned
//! synchronously from the offending call and leave block state untouched.
//! Everything else (protocol violations, source failures, scheduling failures
//! and user faults) is recorded by the block and surfaces exactly once through
//! its completion as an [`AggregateFault`].

use crate::config::ConfigurationError;
use crate::scheduling::SchedulerError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DataflowError {
    #[error("Invalid message header: {0}")]
    InvalidMessageHeader(u64),
    #[error("Consume-to-accept offers require a source")]
    MissingSource,
    #[error("Invalid batch size {0}: must be positive")]
    InvalidBatchSize(usize),
    #[error("Bounded capacity {bounded_capacity} is smaller than batch size {batch_size}")]
    BoundedCapacityBelowBatchSize {
        bounded_capacity: usize,
        batch_size: usize,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Source failure: {0}")]
    SourceFailure(String),
    #[error("Scheduling error: {0}")]
    Scheduling(String),
    #[error("Block faulted: {0}")]
    Fault(String),
    #[error("Block faulted: {0}")]
    User(Arc<dyn std::error::Error + Send + Sync>),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DataflowError {
    /// Wrap an arbitrary error as a user fault
    pub fn user<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DataflowError::User(Arc::new(error))
    }

    /// Build a user fault from a message
    pub fn fault(message: impl Into<String>) -> Self {
        DataflowError::Fault(message.into())
    }

    /// Argument errors are returned synchronously and never fault a block
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            DataflowError::InvalidMessageHeader(_)
                | DataflowError::MissingSource
                | DataflowError::InvalidBatchSize(_)
                | DataflowError::BoundedCapacityBelowBatchSize { .. }
                | DataflowError::InvalidConfiguration(_)
        )
    }
}

impl From<ConfigurationError> for DataflowError {
    fn from(error: ConfigurationError) -> Self {
        DataflowError::Configuration(error.to_string())
    }
}

impl From<SchedulerError> for DataflowError {
    fn from(error: SchedulerError) -> Self {
        DataflowError::Scheduling(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DataflowError>;

/// Every fault a block accumulated before completing, surfaced once.
#[derive(Debug, Clone)]
pub struct AggregateFault {
    errors: Vec<DataflowError>,
}

impl AggregateFault {
    pub fn new(errors: Vec<DataflowError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[DataflowError] {
        &self.errors
    }

    pub fn first(&self) -> Option<&DataflowError> {
        self.errors.first()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_errors(self) -> Vec<DataflowError> {
        self.errors
    }
}

impl fmt::Display for AggregateFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred", self.errors.len())?;
        for (index, error) in self.errors.iter().enumerate() {
            let separator = if index == 0 { ": " } else { "; " };
            write!(f, "{separator}{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFault {}
