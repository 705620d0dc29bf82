//! # Block Configuration
//!
//! Settings shared by every grouping block, plus the runtime options that
//! carry non-serializable collaborators (scheduler, cancellation token).
//!
//! ## Architecture
//!
//! - **GroupingSettings**: plain, serializable knobs (`greedy`, `bounded_capacity`,
//!   `max_groups`, `max_iterations_per_drain_step`). Values `<= 0` for bounded
//!   capacity and max groups mean "unbounded".
//! - **GroupingBlockOptions**: settings plus the scheduler that runs drain and
//!   finalization work and an optional cancellation token.
//! - **ConfigManager**: layered loading from TOML files and `DATAFLOW__*`
//!   environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_dataflow::config::GroupingBlockOptions;
//!
//! let options = GroupingBlockOptions::default()
//!     .with_greedy(false)
//!     .with_bounded_capacity(16)
//!     .with_max_groups(4);
//! assert!(options.settings.is_bounded());
//! ```

pub mod error;
pub mod loader;

use crate::constants::{DEFAULT_MAX_ITERATIONS_PER_DRAIN_STEP, UNBOUNDED};
use crate::scheduling::{SchedulerError, TaskScheduler, TokioScheduler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Serializable grouping block settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GroupingSettings {
    /// Consume offered messages immediately instead of reserving first
    pub greedy: bool,
    /// Maximum items held by the block and its output at once (`<= 0` = unbounded)
    pub bounded_capacity: i64,
    /// Maximum number of groups the block emits before declining (`<= 0` = unbounded)
    pub max_groups: i64,
    /// Drain iterations per scheduled quantum before re-submitting
    pub max_iterations_per_drain_step: usize,
}

impl Default for GroupingSettings {
    fn default() -> Self {
        Self {
            greedy: true,
            bounded_capacity: UNBOUNDED,
            max_groups: UNBOUNDED,
            max_iterations_per_drain_step: DEFAULT_MAX_ITERATIONS_PER_DRAIN_STEP,
        }
    }
}

impl GroupingSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_iterations_per_drain_step == 0 {
            return Err(ConfigurationError::invalid_value(
                "max_iterations_per_drain_step",
                "0",
                "drain steps must run at least one iteration",
            ));
        }

        Ok(())
    }

    pub fn is_bounded(&self) -> bool {
        self.bounded_capacity > 0
    }

    /// Bounded capacity as a count, `None` when unbounded
    pub fn bounded_capacity(&self) -> Option<usize> {
        if self.bounded_capacity > 0 {
            usize::try_from(self.bounded_capacity).ok()
        } else {
            None
        }
    }

    /// Group quota as a count; unbounded maps to `u64::MAX`
    pub fn max_groups_limit(&self) -> u64 {
        if self.max_groups > 0 {
            self.max_groups.unsigned_abs()
        } else {
            u64::MAX
        }
    }
}

/// Runtime options for constructing a grouping block
#[derive(Debug, Clone, Default)]
pub struct GroupingBlockOptions {
    pub settings: GroupingSettings,
    /// Cancellation routes through the same path as `complete()` with pending work dropped
    pub cancellation: Option<CancellationToken>,
    /// Scheduler for drain and finalization work; defaults to the current Tokio runtime
    pub scheduler: Option<Arc<dyn TaskScheduler>>,
    /// Name used in logs; defaults to the block kind and target id
    pub name: Option<String>,
}

impl GroupingBlockOptions {
    pub fn from_settings(settings: GroupingSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn with_greedy(mut self, greedy: bool) -> Self {
        self.settings.greedy = greedy;
        self
    }

    pub fn with_bounded_capacity(mut self, bounded_capacity: i64) -> Self {
        self.settings.bounded_capacity = bounded_capacity;
        self
    }

    pub fn with_max_groups(mut self, max_groups: i64) -> Self {
        self.settings.max_groups = max_groups;
        self
    }

    pub fn with_max_iterations_per_drain_step(mut self, iterations: usize) -> Self {
        self.settings.max_iterations_per_drain_step = iterations;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn resolve_scheduler(&self) -> Result<Arc<dyn TaskScheduler>, SchedulerError> {
        match &self.scheduler {
            Some(scheduler) => Ok(scheduler.clone()),
            None => Ok(Arc::new(TokioScheduler::current()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_greedy_and_unbounded() {
        let settings = GroupingSettings::default();
        assert!(settings.greedy);
        assert!(!settings.is_bounded());
        assert_eq!(settings.bounded_capacity(), None);
        assert_eq!(settings.max_groups_limit(), u64::MAX);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_non_positive_limits_mean_unbounded() {
        let settings = GroupingSettings {
            bounded_capacity: 0,
            max_groups: -7,
            ..GroupingSettings::default()
        };
        assert_eq!(settings.bounded_capacity(), None);
        assert_eq!(settings.max_groups_limit(), u64::MAX);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let settings = GroupingSettings {
            max_iterations_per_drain_step: 0,
            ..GroupingSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_builder_methods_update_settings() {
        let options = GroupingBlockOptions::default()
            .with_greedy(false)
            .with_bounded_capacity(8)
            .with_max_groups(2)
            .with_max_iterations_per_drain_step(3)
            .with_name("orders");

        assert!(!options.settings.greedy);
        assert_eq!(options.settings.bounded_capacity(), Some(8));
        assert_eq!(options.settings.max_groups_limit(), 2);
        assert_eq!(options.settings.max_iterations_per_drain_step, 3);
        assert_eq!(options.name.as_deref(), Some("orders"));
    }

    #[test]
    fn test_resolve_scheduler_outside_runtime_fails() {
        let options = GroupingBlockOptions::default();
        assert!(options.resolve_scheduler().is_err());
    }
}
