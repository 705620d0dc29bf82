//! Configuration Loader
//!
//! Environment-aware loading of [`GroupingSettings`]. Sources are layered in
//! order, later sources overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. `<dir>/dataflow.toml`
//! 3. `<dir>/dataflow.<environment>.toml`
//! 4. `DATAFLOW__*` environment variables (e.g. `DATAFLOW__BOUNDED_CAPACITY=32`)
//!
//! Every file source is optional.

use super::error::{ConfigResult, ConfigurationError};
use super::{GroupingBlockOptions, GroupingSettings};
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Loaded, validated grouping settings for one environment
#[derive(Debug, Clone)]
pub struct ConfigManager {
    settings: GroupingSettings,
    environment: String,
    config_directory: Option<PathBuf>,
}

impl ConfigManager {
    pub const ENV_PREFIX: &'static str = "DATAFLOW";
    pub const FILE_STEM: &'static str = "dataflow";

    /// Load configuration with environment auto-detection and no file sources
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let mut builder = Config::builder();

        if let Some(dir) = &config_dir {
            debug!(
                "Loading grouping configuration for environment '{}' from directory: {}",
                environment,
                dir.display()
            );
            builder = builder
                .add_source(File::from(Self::base_file(dir)).required(false))
                .add_source(File::from(Self::environment_file(dir, environment)).required(false));
        }

        let layered = builder
            .add_source(
                Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: GroupingSettings = layered
            .try_deserialize()
            .map_err(|e| ConfigurationError::DeserializationError(e.to_string()))?;

        settings.validate()?;

        info!(
            environment = %environment,
            greedy = settings.greedy,
            bounded_capacity = settings.bounded_capacity,
            max_groups = settings.max_groups,
            max_iterations_per_drain_step = settings.max_iterations_per_drain_step,
            "⚙️ CONFIG: Grouping configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            settings,
            environment: environment.to_string(),
            config_directory: config_dir,
        }))
    }

    /// Wrap already-built settings, validating them first
    pub fn from_settings(settings: GroupingSettings, environment: &str) -> ConfigResult<Self> {
        settings.validate()?;
        Ok(ConfigManager {
            settings,
            environment: environment.to_string(),
            config_directory: None,
        })
    }

    pub fn settings(&self) -> &GroupingSettings {
        &self.settings
    }

    /// Fresh block options carrying these settings
    pub fn grouping_options(&self) -> GroupingBlockOptions {
        GroupingBlockOptions::from_settings(self.settings.clone())
    }

    /// Settings rendered as JSON for diagnostics
    pub fn debug_config(&self) -> serde_json::Value {
        serde_json::json!({
            "environment": self.environment,
            "config_directory": self.config_directory.as_ref().map(|d| d.display().to_string()),
            "settings": self.settings,
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> Option<&Path> {
        self.config_directory.as_deref()
    }

    /// Detect current environment from environment variables
    fn detect_environment() -> String {
        env::var("DATAFLOW_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn base_file(dir: &Path) -> PathBuf {
        dir.join(format!("{}.toml", Self::FILE_STEM))
    }

    fn environment_file(dir: &Path, environment: &str) -> PathBuf {
        dir.join(format!("{}.{}.toml", Self::FILE_STEM, environment))
    }
}
