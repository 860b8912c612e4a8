//! # Integration Tests
//!
//! Integration and end-to-end tests.
//!
//! Covers:
//! - Contract snapshot tests
//! - Fan-in -> batch -> sink pipelines on every dispatcher
//! - Blueprint-driven assembly

#[cfg(test)]
mod contract_tests {
    use contracts::{Demand, DispatcherKindConfig, PipelineBlueprint};

    #[test]
    fn test_contracts_compile() {
        let _ = contracts::ConfigVersion::V1;
        assert!(Demand::UNBOUNDED.is_unbounded());
    }

    #[test]
    fn test_blueprint_defaults_snapshot() {
        let bp: PipelineBlueprint = minimal_blueprint();
        assert_eq!(bp.dispatcher.kind, DispatcherKindConfig::Worker);
        assert_eq!(bp.dispatcher.name, "stage-worker");
        assert_eq!(bp.dispatcher.queue_capacity, 1024);
        assert_eq!(bp.demand.initial(), u64::MAX);
        assert!(bp.batch.timespan().is_none());
    }

    fn minimal_blueprint() -> PipelineBlueprint {
        config_loader::ConfigLoader::load_from_str(
            "[batch]\nsize = 1\n[merge]\nsources = 1\nelements_per_source = 1\n",
            config_loader::ConfigFormat::Toml,
        )
        .unwrap()
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use contracts::{Dispatcher, Publisher, SharedPublisher, StreamError, Timer};
    use dispatcher::{ManualTimer, SynchronousDispatcher, TailRecurseDispatcher, WorkerDispatcher};
    use sources::{ChannelSource, CollectSink, IterSource, Terminal};
    use stages::{BatchConfig, BatchStage, FanInStage, MergeStatus};

    fn publisher<T: Clone + Send + Sync + 'static>(values: Vec<T>) -> SharedPublisher<T> {
        Arc::new(IterSource::new(values))
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// IterSource -> FanInStage -> BatchStage(buffer, 3) -> CollectSink
    #[test]
    fn test_single_source_is_cut_into_windows() {
        let dispatcher = SynchronousDispatcher::shared();
        let merge = FanInStage::with_sources(
            Arc::clone(&dispatcher),
            vec![publisher(vec!['a', 'b', 'c', 'd', 'e'])],
        );
        let batch = BatchStage::buffer(BatchConfig::new(3), dispatcher, None).unwrap();
        merge.subscribe(batch.clone());

        let sink = CollectSink::unbounded();
        batch.subscribe(sink.clone());

        assert_eq!(sink.values(), vec![vec!['a', 'b', 'c'], vec!['d', 'e']]);
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
        assert_eq!(merge.status(), MergeStatus::Completed);
    }

    /// Every merged element reaches the sink exactly once, in bounded steps
    #[test]
    fn test_merged_sources_with_bounded_demand() {
        let dispatcher = TailRecurseDispatcher::shared();
        let merge = FanInStage::with_sources(
            Arc::clone(&dispatcher),
            vec![
                publisher((0..10u32).collect()),
                publisher((100..105u32).collect()),
                publisher((200..207u32).collect()),
            ],
        );
        let batch = BatchStage::buffer(BatchConfig::new(4), dispatcher, None).unwrap();
        merge.subscribe(batch.clone());

        let sink = CollectSink::with_initial_request(1);
        batch.subscribe(sink.clone());
        assert_eq!(sink.len(), 1);

        while sink.terminal().is_none() {
            sink.request(1);
        }

        let windows = sink.values();
        assert!(windows[..windows.len() - 1].iter().all(|w| w.len() == 4));
        let mut all: Vec<u32> = windows.into_iter().flatten().collect();
        all.sort_unstable();
        let mut expected: Vec<u32> = (0..10).chain(100..105).chain(200..207).collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
    }

    /// One failing source ends the stream with its error and cancels the rest
    #[test]
    fn test_source_failure_propagates_through_batch() {
        let dispatcher = SynchronousDispatcher::shared();
        let healthy = Arc::new(IterSource::new(vec![1u32, 2, 3]).without_completion());
        let failing = Arc::new(
            IterSource::new(vec![10u32]).with_error(StreamError::upstream("source lost")),
        );
        let merge = FanInStage::with_sources(
            Arc::clone(&dispatcher),
            vec![
                healthy.clone() as SharedPublisher<u32>,
                failing as SharedPublisher<u32>,
            ],
        );
        let batch = BatchStage::last(BatchConfig::new(2), dispatcher, None).unwrap();
        merge.subscribe(batch.clone());

        let sink = CollectSink::unbounded();
        batch.subscribe(sink.clone());

        assert_eq!(sink.terminal(), Some(Terminal::Error));
        assert!(matches!(sink.error(), Some(StreamError::Upstream { .. })));
        assert!(healthy.is_cancelled());
        assert_eq!(merge.status(), MergeStatus::Completed);
    }

    /// A stream of publishers merged two at a time
    #[test]
    fn test_dynamic_merge_feeds_batches() {
        let dispatcher = SynchronousDispatcher::shared();
        let outer = Arc::new(IterSource::new(vec![
            publisher(vec![1u32, 2, 3]),
            publisher(vec![4, 5]),
            publisher(vec![6]),
            publisher(vec![7, 8, 9, 10]),
        ]));
        let merge = FanInStage::merge_dynamic(Arc::clone(&dispatcher), outer.clone(), Some(2));
        let batch = BatchStage::first(BatchConfig::new(5), dispatcher, None).unwrap();
        merge.subscribe(batch.clone());

        let sink = CollectSink::unbounded();
        batch.subscribe(sink.clone());

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
        assert_eq!(merge.running(), 0);
        // Slots were refilled as sources terminated
        assert!(outer.requested() > 2);
    }

    /// Timer flushes run on the worker; count flushes still happen inline
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_flush_on_worker() {
        let worker = WorkerDispatcher::spawn("e2e-worker", 64);
        let dispatcher: Arc<dyn Dispatcher> = worker.clone();
        let timer = ManualTimer::new();

        let source = Arc::new(IterSource::new(vec![1u32, 2, 3]).without_completion());
        let merge = FanInStage::with_sources(
            Arc::clone(&dispatcher),
            vec![source.clone() as SharedPublisher<u32>],
        );
        let batch = BatchStage::buffer(
            BatchConfig::new(10).with_timespan(Duration::from_millis(50)),
            dispatcher,
            Some(timer.clone() as Arc<dyn Timer>),
        )
        .unwrap();
        merge.subscribe(batch.clone());

        let sink = CollectSink::unbounded();
        batch.subscribe(sink.clone());

        wait_for(|| batch.window_len() == 3).await;
        assert!(sink.is_empty());

        assert_eq!(timer.tick(), 1);
        wait_for(|| sink.len() == 1).await;
        assert_eq!(sink.values(), vec![vec![1, 2, 3]]);
        assert_eq!(batch.window_len(), 0);

        // An empty window does not flush
        timer.tick();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.len(), 1);

        sink.cancel();
        wait_for(|| source.is_cancelled()).await;
        worker.shutdown().await;
    }

    /// Live channel producers backed off by demand
    #[tokio::test]
    async fn test_channel_sources_merge_to_completion() {
        let dispatcher = SynchronousDispatcher::shared();
        let mut publishers: Vec<SharedPublisher<u64>> = Vec::new();
        let mut producers = Vec::new();
        for i in 0..3u64 {
            let (tx, rx) = async_channel::bounded(1);
            publishers.push(Arc::new(ChannelSource::new(format!("chan-{i}"), rx)));
            producers.push(tokio::spawn(async move {
                for n in 0..4u64 {
                    if tx.send(i * 10 + n).await.is_err() {
                        break;
                    }
                }
            }));
        }

        let merge = FanInStage::with_sources(Arc::clone(&dispatcher), publishers);
        let batch = BatchStage::buffer(BatchConfig::new(5), dispatcher, None).unwrap();
        merge.subscribe(batch.clone());
        let sink = CollectSink::unbounded();
        batch.subscribe(sink.clone());

        let terminal = tokio::time::timeout(Duration::from_secs(2), sink.wait_terminal())
            .await
            .unwrap();
        assert_eq!(terminal, Terminal::Complete);
        let elements: usize = sink.values().iter().map(Vec::len).sum();
        assert_eq!(elements, 12);
        assert_eq!(sink.len(), 3);

        for producer in producers {
            producer.await.unwrap();
        }
    }
}

#[cfg(test)]
mod blueprint_tests {
    use std::sync::Arc;

    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{Dispatcher, DispatcherKindConfig, Publisher, SharedPublisher};
    use dispatcher::{SynchronousDispatcher, TailRecurseDispatcher};
    use sources::{CollectSink, IterSource, Terminal};
    use stages::{BatchConfig, BatchStage, FanInStage};

    /// Blueprint -> stages assembled by hand, the way the CLI does
    #[test]
    fn test_blueprint_drives_assembly() {
        let bp = ConfigLoader::load_from_str(
            r#"
            [dispatcher]
            kind = "tail_recurse"

            [batch]
            size = 4

            [merge]
            sources = 3
            elements_per_source = 6

            [demand]
            initial_request = 2
            "#,
            ConfigFormat::Toml,
        )
        .unwrap();

        let dispatcher: Arc<dyn Dispatcher> = match bp.dispatcher.kind {
            DispatcherKindConfig::TailRecurse => TailRecurseDispatcher::shared(),
            _ => SynchronousDispatcher::shared(),
        };
        let publishers: Vec<SharedPublisher<u64>> = (0..bp.merge.sources as u64)
            .map(|s| {
                let values: Vec<u64> = (0..bp.merge.elements_per_source)
                    .map(|n| s * 1000 + n)
                    .collect();
                Arc::new(IterSource::new(values)) as SharedPublisher<u64>
            })
            .collect();

        let merge = FanInStage::with_sources(Arc::clone(&dispatcher), publishers);
        let batch = BatchStage::buffer(BatchConfig::new(bp.batch.size), dispatcher, None).unwrap();
        merge.subscribe(batch.clone());

        let sink = CollectSink::with_initial_request(bp.demand.initial());
        batch.subscribe(sink.clone());
        assert_eq!(sink.len(), 2);

        sink.request(u64::MAX);
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
        let elements: usize = sink.values().iter().map(Vec::len).sum();
        assert_eq!(elements, 18);
        // 18 elements in windows of 4
        assert_eq!(sink.len(), 5);
    }
}
