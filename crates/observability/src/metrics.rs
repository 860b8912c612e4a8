//! Stage metrics
//!
//! Prometheus recorders called from the stages, plus an in-memory aggregator
//! used by the CLI to print a run summary.

use contracts::StreamError;
use metrics::{counter, gauge, histogram};

/// What closed a batch window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushTrigger {
    /// Window reached `batch_size`
    Count,
    /// Timer tick on a non-empty window
    Timeout,
    /// Upstream completed with a non-empty window
    Complete,
}

impl FlushTrigger {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Count => "count",
            FlushTrigger::Timeout => "timeout",
            FlushTrigger::Complete => "complete",
        }
    }
}

/// Record a window flush
///
/// # Example
///
/// ```ignore
/// use observability::metrics::{record_batch_flushed, FlushTrigger};
///
/// record_batch_flushed("batch", 3, FlushTrigger::Count);
/// ```
pub fn record_batch_flushed(stage: &str, window_len: usize, trigger: FlushTrigger) {
    counter!(
        "backflow_batches_flushed_total",
        "stage" => stage.to_string(),
        "trigger" => trigger.as_str()
    )
    .increment(1);

    histogram!("backflow_batch_window_len", "stage" => stage.to_string())
        .record(window_len as f64);
}

/// Record a timer flush skipped because the dispatcher was saturated
pub fn record_timer_flush_dropped(stage: &str) {
    counter!(
        "backflow_timer_flush_dropped_total",
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Record an inner source terminating; `running` is the count left afterwards
pub fn record_source_terminated(stage: &str, failed: bool, running: usize) {
    let outcome = if failed { "error" } else { "complete" };
    counter!(
        "backflow_sources_terminated_total",
        "stage" => stage.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    gauge!("backflow_sources_running", "stage" => stage.to_string()).set(running as f64);
}

/// Record a stage failing downstream
pub fn record_merge_failed(stage: &str, error: &StreamError) {
    counter!(
        "backflow_stage_failures_total",
        "stage" => stage.to_string(),
        "kind" => error.kind()
    )
    .increment(1);
}

/// Stage metrics aggregator
///
/// Aggregates in memory for statistics and summary output.
#[derive(Debug, Clone, Default)]
pub struct StageMetricsAggregator {
    /// Total elements received downstream
    pub total_elements: u64,

    /// Total batches received downstream
    pub total_batches: u64,

    /// Inner sources that completed
    pub sources_completed: u64,

    /// Inner sources that failed
    pub sources_failed: u64,

    /// Batch length statistics
    pub batch_stats: RunningStats,
}

impl StageMetricsAggregator {
    /// Create a new aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch of `len` elements reached the sink
    pub fn on_batch(&mut self, len: usize) {
        self.total_batches += 1;
        self.total_elements += len as u64;
        self.batch_stats.push(len as f64);
    }

    /// An inner source terminated
    pub fn on_source_terminated(&mut self, failed: bool) {
        if failed {
            self.sources_failed += 1;
        } else {
            self.sources_completed += 1;
        }
    }

    /// Generate summary report
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_elements: self.total_elements,
            total_batches: self.total_batches,
            sources_completed: self.sources_completed,
            sources_failed: self.sources_failed,
            batch_len: StatsSummary::from(&self.batch_stats),
        }
    }

    /// Reset statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Metrics summary
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub total_elements: u64,
    pub total_batches: u64,
    pub sources_completed: u64,
    pub sources_failed: u64,
    pub batch_len: StatsSummary,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Stage Metrics Summary ===")?;
        writeln!(f, "Total elements: {}", self.total_elements)?;
        writeln!(f, "Total batches: {}", self.total_batches)?;
        writeln!(f, "Batch length: {}", self.batch_len)?;
        writeln!(
            f,
            "Sources: {} completed, {} failed",
            self.sources_completed, self.sources_failed
        )?;
        Ok(())
    }
}

/// Statistics summary
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.1}, max={:.1}, mean={:.2}, std={:.2} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// Online statistics (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// Add a sample
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
            return;
        }

        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Sample count
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean, 0 when empty
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// Standard deviation
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}
