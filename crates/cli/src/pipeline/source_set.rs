//! Generated sources feeding the fan-in stage.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use contracts::{Dispatcher, MergeSection, Publisher, SharedPublisher, Signal, StreamError};
use observability::StageMetricsAggregator;
use sources::{ChannelSource, IterSource};
use stages::FinallyStage;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Element produced by a generated source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub source: usize,
    pub seq: u64,
}

/// Sources described by a `[merge]` section
///
/// Each source is wrapped in a `FinallyStage` recording its termination.
pub struct SourceSet {
    pub publishers: Vec<SharedPublisher<Reading>>,
    producers: Vec<JoinHandle<()>>,
}

impl SourceSet {
    /// Build the sources; paced sources spawn their producer on the current runtime
    pub fn build(
        merge: &MergeSection,
        dispatcher: &Arc<dyn Dispatcher>,
        metrics: &Arc<Mutex<StageMetricsAggregator>>,
    ) -> Self {
        let mut publishers = Vec::with_capacity(merge.sources);
        let mut producers = Vec::new();

        for source in 0..merge.sources {
            let name = format!("source-{source}");
            let failure = (merge.fail_source == Some(source))
                .then(|| StreamError::upstream(format!("{name} failed")));

            let publisher: SharedPublisher<Reading> = if merge.interval_ms == 0 {
                let readings = (0..merge.elements_per_source).map(|seq| Reading { source, seq });
                let iter = IterSource::new(readings).named(name.clone());
                match failure {
                    Some(error) => Arc::new(iter.with_error(error)),
                    None => Arc::new(iter),
                }
            } else {
                let (tx, rx) = async_channel::bounded(1);
                producers.push(spawn_producer(
                    source,
                    merge.elements_per_source,
                    Duration::from_millis(merge.interval_ms),
                    tx,
                ));
                let channel = ChannelSource::new(name.clone(), rx);
                match failure {
                    Some(error) => Arc::new(channel.with_close_error(error)),
                    None => Arc::new(channel),
                }
            };

            publishers.push(observe(publisher, dispatcher, metrics));
            debug!(source = %name, paced = merge.interval_ms > 0, "Source built");
        }

        Self {
            publishers,
            producers,
        }
    }

    /// Stop paced producers still running
    pub fn abort(&self) {
        for producer in &self.producers {
            producer.abort();
        }
    }
}

fn observe(
    publisher: SharedPublisher<Reading>,
    dispatcher: &Arc<dyn Dispatcher>,
    metrics: &Arc<Mutex<StageMetricsAggregator>>,
) -> SharedPublisher<Reading> {
    let metrics = Arc::clone(metrics);
    let observed = FinallyStage::new(Arc::clone(dispatcher), move |signal: &Signal<Reading>| {
        let failed = matches!(signal, Signal::Error(_));
        metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_source_terminated(failed);
    });
    publisher.subscribe(observed.clone());
    observed
}

fn spawn_producer(
    source: usize,
    elements: u64,
    interval: Duration,
    tx: async_channel::Sender<Reading>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        for seq in 0..elements {
            ticker.tick().await;
            // Bounded channel: waits while the pipeline applies backpressure
            if tx.send(Reading { source, seq }).await.is_err() {
                return;
            }
            trace!(source, seq, "Reading produced");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatcher::SynchronousDispatcher;
    use sources::{CollectSink, Terminal};

    fn section(sources: usize, fail_source: Option<usize>) -> MergeSection {
        MergeSection {
            sources,
            elements_per_source: 3,
            interval_ms: 0,
            fail_source,
            dynamic: false,
            max_concurrency: None,
        }
    }

    #[tokio::test]
    async fn test_failing_source_recorded() {
        let metrics = Arc::new(Mutex::new(StageMetricsAggregator::new()));
        let set = SourceSet::build(
            &section(2, Some(1)),
            &SynchronousDispatcher::shared(),
            &metrics,
        );
        assert_eq!(set.publishers.len(), 2);

        let healthy = CollectSink::unbounded();
        set.publishers[0].subscribe(healthy.clone());
        let failing = CollectSink::unbounded();
        set.publishers[1].subscribe(failing.clone());

        assert_eq!(healthy.len(), 3);
        assert_eq!(healthy.terminal(), Some(Terminal::Complete));
        assert_eq!(failing.terminal(), Some(Terminal::Error));

        let summary = metrics.lock().unwrap().summary();
        assert_eq!(summary.sources_completed, 1);
        assert_eq!(summary.sources_failed, 1);
    }
}
