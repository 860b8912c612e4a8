//! # Stages
//!
//! Backpressure-aware processing stages.
//!
//! Provides:
//! - `StageCore`: serial, demand-gated delivery plus upstream bookkeeping
//!   shared by every stage
//! - `BatchStage`: count and time bounded windows with pluggable policies
//! - `FanInStage`: dynamic merge of many sources, with `DynamicMerge` feeding
//!   it from a stream of publishers
//! - `FinallyStage`: pass-through running a side effect on termination
//!
//! ## Usage
//!
//! ```ignore
//! use stages::{BatchConfig, BatchStage, FanInStage};
//!
//! let merge = FanInStage::with_sources(dispatcher.clone(), sources);
//! let batch = BatchStage::buffer(BatchConfig::new(3), dispatcher, None)?;
//! merge.subscribe(batch.clone());
//! batch.subscribe(sink);
//! ```

pub mod batch;
pub mod dynamic_merge;
pub mod fan_in;
pub mod finally;
pub mod policy;
pub mod stage;

pub use batch::{BatchConfig, BatchStage};
pub use dynamic_merge::DynamicMerge;
pub use fan_in::{CompanionState, FanInStage, InnerSource, MergeStatus};
pub use finally::{FinallyAction, FinallyStage};
pub use policy::{BatchCallbacks, Buffer, FirstOfWindow, LastOfWindow, Outbox};
pub use stage::{SerialEmitter, Stage, StageCore, StageSubscription};
