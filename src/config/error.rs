//! Configuration Error Types
//!
//! Specific, actionable errors for loading and validating block settings.

use thiserror::Error;

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// A configuration source could not be read or parsed
    #[error("Failed to load configuration from {source_name}: {error}")]
    LoadError { source_name: String, error: String },

    /// Layered configuration could not be mapped onto the settings structure
    #[error("Failed to deserialize configuration: {0}")]
    DeserializationError(String),
}

impl ConfigurationError {
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        ConfigurationError::InvalidValue {
            field: field.into(),
            value: value.into(),
            context: context.into(),
        }
    }

    pub fn load_error(source_name: impl Into<String>, error: impl ToString) -> Self {
        ConfigurationError::LoadError {
            source_name: source_name.into(),
            error: error.to_string(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        match error {
            config::ConfigError::FileParse { uri, cause } => ConfigurationError::load_error(
                uri.unwrap_or_else(|| "configuration file".to_string()),
                cause,
            ),
            other => ConfigurationError::DeserializationError(other.to_string()),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
