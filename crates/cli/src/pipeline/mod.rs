//! Pipeline orchestration module.

mod orchestrator;
mod source_set;
mod stats;

pub use orchestrator::{Pipeline, PipelineConfig};
pub use source_set::{Reading, SourceSet};
pub use stats::{Outcome, PipelineStats};
