//! Error types for CLI operations.

use contracts::StreamError;
use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// A stage could not be built from the configuration
    #[error("Failed to assemble pipeline: {0}")]
    Assembly(#[source] StreamError),

    /// The stream terminated with an error
    #[error("Pipeline stream failed: {0}")]
    StreamFailed(#[source] StreamError),
}

impl CliError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }
}

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
