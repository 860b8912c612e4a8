//! Pipeline statistics.

use std::fmt;
use std::time::Duration;

use contracts::StreamError;
use observability::StageMetricsAggregator;

/// How a pipeline run ended
#[derive(Debug, Clone, Default)]
pub enum Outcome {
    /// The stream completed
    #[default]
    Completed,
    /// The stream failed
    Failed(StreamError),
    /// Stopped after `--max-batches`
    BatchLimit,
    /// Stopped by `--timeout`
    TimedOut,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Failed(error) => write!(f, "failed ({error})"),
            Outcome::BatchLimit => write!(f, "stopped at batch limit"),
            Outcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Statistics from a pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Merged sources
    pub sources: usize,

    /// Total duration of the run
    pub duration: Duration,

    /// How the run ended
    pub outcome: Outcome,

    /// Batch and source counters
    pub metrics: StageMetricsAggregator,
}

impl PipelineStats {
    pub fn batches(&self) -> u64 {
        self.metrics.total_batches
    }

    pub fn elements(&self) -> u64 {
        self.metrics.total_elements
    }

    /// Elements per second
    pub fn throughput(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.elements() as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n=== Pipeline Statistics ===\n");
        println!("Overview");
        println!("  Outcome: {}", self.outcome);
        println!("  Duration: {:.2}s", self.duration.as_secs_f64());
        println!("  Sources: {}", self.sources);
        println!("  Batches: {}", self.batches());
        println!("  Elements: {}", self.elements());
        println!("  Throughput: {:.2} elements/s", self.throughput());
        println!();
        print!("{}", self.metrics.summary());
        println!();
    }
}
