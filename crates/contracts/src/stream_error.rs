//! Stream errors carried by `Signal::Error`.
//!
//! Errors are broadcast downstream and may be observed by several parties, so
//! every variant is cheaply `Clone` (causes are kept behind `Arc`).

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::DispatchError;

/// Boxed error returned by user callbacks
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The element being processed when a failure happened
///
/// Kept type-erased so a consumer can recover the poison element with
/// [`StreamError::element`].
#[derive(Clone)]
pub struct ElementContext {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ElementContext {
    /// Wrap an element
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow the element if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Type name of the wrapped element
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for ElementContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ElementContext").field(&self.type_name).finish()
    }
}

/// Errors produced by stages
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// `request(0)`
    #[error("invalid demand: request({requested}) must be > 0")]
    InvalidDemand { requested: u64 },

    /// Invalid construction parameter
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// A stage accepts a single downstream subscriber
    #[error("stage already has a downstream subscriber")]
    AlreadySubscribed,

    /// Element processing failed; the offending element is attached
    #[error("element processing failed: {cause}")]
    ElementFailed {
        #[source]
        cause: Arc<dyn StdError + Send + Sync>,
        element: ElementContext,
    },

    /// A window flush without a triggering element failed
    #[error("window flush failed: {cause}")]
    FlushFailed {
        #[source]
        cause: Arc<dyn StdError + Send + Sync>,
    },

    /// Upstream source failure
    #[error("upstream failed: {message}")]
    Upstream { message: String },

    /// Dispatcher refused a task
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// Stream was cancelled before completion
    #[error("stream cancelled")]
    Cancelled,
}

impl StreamError {
    /// Create an upstream failure
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// Wrap a processing failure together with the element that caused it
    pub fn element_failed<T: Any + Send + Sync>(cause: BoxError, element: T) -> Self {
        Self::ElementFailed {
            cause: Arc::from(cause),
            element: ElementContext::new(element),
        }
    }

    /// Recover the poison element of an `ElementFailed` error
    pub fn element<T: Any>(&self) -> Option<&T> {
        match self {
            Self::ElementFailed { element, .. } => element.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidDemand { .. } => "invalid_demand",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::AlreadySubscribed => "already_subscribed",
            Self::ElementFailed { .. } => "element_failed",
            Self::FlushFailed { .. } => "flush_failed",
            Self::Upstream { .. } => "upstream",
            Self::Dispatch(_) => "dispatch",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_failed_recovers_element() {
        let err = StreamError::element_failed("boom".into(), 42_u32);
        assert_eq!(err.element::<u32>(), Some(&42));
        assert_eq!(err.element::<String>(), None);
        assert!(err.to_string().contains("boom"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_clone_shares_cause() {
        let err = StreamError::element_failed("bad".into(), "x".to_string());
        let cloned = err.clone();
        assert_eq!(cloned.element::<String>().map(String::as_str), Some("x"));
    }

    #[test]
    fn test_non_element_errors_have_no_element() {
        assert!(StreamError::upstream("down").element::<u32>().is_none());
        assert!(StreamError::Cancelled.element::<u32>().is_none());
    }
}
