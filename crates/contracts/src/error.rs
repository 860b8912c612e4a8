//! Configuration error definitions
//!
//! Stream-time failures live in [`StreamError`](crate::StreamError); this type
//! covers loading and validating a [`PipelineBlueprint`](crate::PipelineBlueprint).

use thiserror::Error;

/// Failure to load a pipeline configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File extension is not a known format
    #[error("unsupported config format: {extension}")]
    UnsupportedFormat { extension: String },

    /// Syntax or type error in the document
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A field is out of range or contradicts another field
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn unsupported_format(extension: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            extension: extension.into(),
        }
    }

    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Dotted path of the offending field, for validation errors
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::ConfigValidation { field, .. } => Some(field),
            _ => None,
        }
    }
}
