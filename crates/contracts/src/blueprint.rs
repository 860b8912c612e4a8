//! PipelineBlueprint - Config Loader output
//!
//! Describes a demo pipeline: which dispatcher runs the stages, how the
//! fan-in sources are generated, how batches are cut and how much demand the
//! final consumer signals.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete pipeline blueprint
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineBlueprint {
    /// Configuration version
    #[serde(default)]
    pub version: ConfigVersion,

    /// Dispatcher running the stages
    #[serde(default)]
    #[validate(nested)]
    pub dispatcher: DispatcherConfig,

    /// Batching stage
    #[validate(nested)]
    pub batch: BatchSection,

    /// Fan-in sources
    #[validate(nested)]
    pub merge: MergeSection,

    /// Downstream demand
    #[serde(default)]
    pub demand: DemandSection,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatcherConfig {
    /// Execution model
    #[serde(default)]
    pub kind: DispatcherKindConfig,

    /// Name used in logs and metrics
    #[serde(default = "default_dispatcher_name")]
    #[validate(length(min = 1))]
    pub name: String,

    /// Soft queue capacity (worker dispatcher only)
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            kind: DispatcherKindConfig::default(),
            name: default_dispatcher_name(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_dispatcher_name() -> String {
    "stage-worker".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

/// Dispatcher kind as written in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherKindConfig {
    Synchronous,
    TailRecurse,
    #[default]
    Worker,
}

/// Batching stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatchSection {
    /// Elements per window, must be > 0
    #[validate(range(min = 1))]
    pub size: usize,

    /// What a window emits
    #[serde(default)]
    pub policy: BatchPolicyKind,

    /// Time-bounded flush period in milliseconds
    #[serde(default)]
    #[validate(range(min = 1))]
    pub timespan_ms: Option<u64>,
}

impl BatchSection {
    /// Flush period, if any
    pub fn timespan(&self) -> Option<Duration> {
        self.timespan_ms.map(Duration::from_millis)
    }
}

/// Batching policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicyKind {
    /// Emit every window as a `Vec`
    #[default]
    Buffer,
    /// Emit the first element of each window
    First,
    /// Emit the last element of each window
    Last,
}

/// Fan-in source configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MergeSection {
    /// Number of merged sources
    #[validate(range(min = 1))]
    pub sources: usize,

    /// Elements produced by each source
    #[validate(range(min = 1))]
    pub elements_per_source: u64,

    /// Interval between elements in ms (0 = emit on demand, no pacing)
    #[serde(default)]
    pub interval_ms: u64,

    /// Index of a source that fails after its elements
    #[serde(default)]
    pub fail_source: Option<usize>,

    /// Feed sources through a dynamic merge instead of a fixed set
    #[serde(default)]
    pub dynamic: bool,

    /// Concurrent sources for dynamic merge (None = all)
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_concurrency: Option<usize>,
}

/// Downstream demand
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DemandSection {
    /// Batches requested up front (0 = unbounded)
    #[serde(default)]
    pub initial_request: u64,
}

impl DemandSection {
    /// Initial request as a raw demand count
    pub fn initial(&self) -> u64 {
        if self.initial_request == 0 {
            u64::MAX
        } else {
            self.initial_request
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blueprint_json_defaults() {
        let json = r#"{
            "batch": { "size": 3 },
            "merge": { "sources": 2, "elements_per_source": 5 }
        }"#;
        let bp: PipelineBlueprint = serde_json::from_str(json).unwrap();
        assert_eq!(bp.dispatcher.kind, DispatcherKindConfig::Worker);
        assert_eq!(bp.dispatcher.queue_capacity, 1024);
        assert_eq!(bp.batch.policy, BatchPolicyKind::Buffer);
        assert_eq!(bp.demand.initial(), u64::MAX);
        assert!(bp.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_fails_validation() {
        let json = r#"{
            "batch": { "size": 0 },
            "merge": { "sources": 1, "elements_per_source": 1 }
        }"#;
        let bp: PipelineBlueprint = serde_json::from_str(json).unwrap();
        assert!(bp.validate().is_err());
    }
}
