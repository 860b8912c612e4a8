//! Pipeline orchestrator - assembles and drives the stages.
//!
//! sources -> FanInStage -> BatchStage -> FinallyStage -> CollectSink

use std::future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use contracts::{
    BatchPolicyKind, Dispatcher, DispatcherConfig, DispatcherKindConfig, PipelineBlueprint,
    Publisher, Signal, Timer,
};
use dispatcher::{SynchronousDispatcher, TailRecurseDispatcher, TokioTimer, WorkerDispatcher};
use observability::StageMetricsAggregator;
use sources::{CollectSink, IterSource, Terminal};
use stages::{BatchCallbacks, BatchConfig, BatchStage, FanInStage, FinallyStage};
use tracing::{debug, info, warn};

use super::{Outcome, PipelineStats, Reading, SourceSet};
use crate::error::CliError;

/// How often the driver checks limits and replenishes demand
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The pipeline blueprint
    pub blueprint: PipelineBlueprint,

    /// Stop after this many batches (None = until the stream terminates)
    pub max_batches: Option<u64>,

    /// Pipeline timeout (None = no timeout)
    pub timeout: Option<Duration>,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

/// Main pipeline orchestrator
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Run the pipeline to termination, limit or timeout
    pub async fn run(self) -> Result<PipelineStats> {
        let start_time = Instant::now();
        let blueprint = &self.config.blueprint;

        if let Some(port) = self.config.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        let (dispatcher, worker) = build_dispatcher(&blueprint.dispatcher);
        info!(
            dispatcher = dispatcher.name(),
            kind = ?blueprint.dispatcher.kind,
            "Dispatcher ready"
        );

        let metrics = Arc::new(Mutex::new(StageMetricsAggregator::new()));
        let source_set = SourceSet::build(&blueprint.merge, &dispatcher, &metrics);

        let merge = if blueprint.merge.dynamic {
            let outer = IterSource::new(source_set.publishers.clone()).named("outer");
            FanInStage::merge_dynamic(
                Arc::clone(&dispatcher),
                Arc::new(outer),
                blueprint.merge.max_concurrency,
            )
        } else {
            FanInStage::with_sources(Arc::clone(&dispatcher), source_set.publishers.clone())
        };
        info!(
            sources = blueprint.merge.sources,
            dynamic = blueprint.merge.dynamic,
            "Fan-in stage configured"
        );

        let mut batch_config = BatchConfig::new(blueprint.batch.size);
        if let Some(timespan) = blueprint.batch.timespan() {
            batch_config = batch_config.with_timespan(timespan);
        }
        let timer: Option<Arc<dyn Timer>> = blueprint
            .batch
            .timespan()
            .map(|_| Arc::new(TokioTimer::current()) as Arc<dyn Timer>);

        let outcome = match blueprint.batch.policy {
            BatchPolicyKind::Buffer => {
                let batch = BatchStage::buffer(batch_config, Arc::clone(&dispatcher), timer)
                    .map_err(CliError::Assembly)?;
                self.drive(&merge, batch, &dispatcher, &metrics, Vec::len).await
            }
            BatchPolicyKind::First => {
                let batch = BatchStage::first(batch_config, Arc::clone(&dispatcher), timer)
                    .map_err(CliError::Assembly)?;
                self.drive(&merge, batch, &dispatcher, &metrics, |_| 1).await
            }
            BatchPolicyKind::Last => {
                let batch = BatchStage::last(batch_config, Arc::clone(&dispatcher), timer)
                    .map_err(CliError::Assembly)?;
                self.drive(&merge, batch, &dispatcher, &metrics, |_| 1).await
            }
        };

        // Shutdown
        info!("Shutting down pipeline...");
        source_set.abort();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }

        let stats = PipelineStats {
            sources: blueprint.merge.sources,
            duration: start_time.elapsed(),
            outcome,
            metrics: metrics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };

        info!(
            outcome = %stats.outcome,
            batches = stats.batches(),
            elements = stats.elements(),
            duration_secs = stats.duration.as_secs_f64(),
            "Pipeline shutdown complete"
        );

        Ok(stats)
    }

    /// Subscribe the sink and pull batches until the run ends
    ///
    /// A bounded initial request is replenished each time the sink has
    /// received everything it asked for.
    async fn drive<P>(
        &self,
        merge: &Arc<FanInStage<Reading>>,
        batch: Arc<BatchStage<Reading, P>>,
        dispatcher: &Arc<dyn Dispatcher>,
        metrics: &Arc<Mutex<StageMetricsAggregator>>,
        batch_len: impl Fn(&P::Output) -> usize,
    ) -> Outcome
    where
        P: BatchCallbacks<Reading>,
    {
        let started = Instant::now();
        let finally = FinallyStage::new(Arc::clone(dispatcher), move |signal: &Signal<P::Output>| {
            info!(
                signal = signal.kind(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Batch stream terminated"
            );
        });

        merge.subscribe(batch.clone());
        batch.subscribe(finally.clone());

        let initial = self.config.blueprint.demand.initial();
        let sink = CollectSink::with_initial_request(initial);
        finally.subscribe(sink.clone());

        let deadline = self
            .config
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        let mut requested = initial;

        let outcome = loop {
            tokio::select! {
                terminal = sink.wait_terminal() => {
                    break match terminal {
                        Terminal::Complete => Outcome::Completed,
                        Terminal::Error => match sink.error() {
                            Some(error) => Outcome::Failed(error),
                            None => Outcome::Completed,
                        },
                    };
                }
                _ = sleep_until(deadline) => {
                    warn!(timeout_secs = self.config.timeout.map(|t| t.as_secs()), "Pipeline timed out");
                    sink.cancel();
                    break Outcome::TimedOut;
                }
                _ = ticker.tick() => {}
            }

            let received = sink.len() as u64;
            if let Some(max) = self.config.max_batches {
                if received >= max {
                    info!(batches = received, "Reached max batches limit");
                    sink.cancel();
                    break Outcome::BatchLimit;
                }
            }
            if initial != u64::MAX && received >= requested {
                debug!(received, "Replenishing demand");
                sink.request(initial);
                requested = requested.saturating_add(initial);
            }
        };

        let mut metrics = metrics.lock().unwrap_or_else(PoisonError::into_inner);
        for value in sink.take_values() {
            metrics.on_batch(batch_len(&value));
        }
        outcome
    }
}

fn build_dispatcher(
    config: &DispatcherConfig,
) -> (Arc<dyn Dispatcher>, Option<Arc<WorkerDispatcher>>) {
    match config.kind {
        DispatcherKindConfig::Synchronous => (SynchronousDispatcher::shared(), None),
        DispatcherKindConfig::TailRecurse => (TailRecurseDispatcher::shared(), None),
        DispatcherKindConfig::Worker => {
            let worker = WorkerDispatcher::spawn(config.name.clone(), config.queue_capacity);
            (worker.clone(), Some(worker))
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
