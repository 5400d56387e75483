//! Workflow executor: drives Source → Pipeline → Consumer.
//!
//! Strictly sequential: one raw item travels end to end before the next
//! one is pulled from the source. A failed item pass is logged, counted,
//! and skipped. A failed source iteration aborts the run.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pipeline::consumer::{Consumed, Consumer};
use crate::pipeline::source::Source;
use crate::pipeline::stage::Pipeline;
use crate::pipeline::types::RunStatistics;
use crate::progress::RunObserver;

/// Runs one source through a pipeline into a consumer.
pub struct WorkflowExecutor {
    observer: Arc<dyn RunObserver>,
}

impl WorkflowExecutor {
    pub fn new(observer: Arc<dyn RunObserver>) -> Self {
        Self { observer }
    }

    /// Run to completion.
    ///
    /// `on_complete` fires exactly once, unless the source fails before
    /// producing its first item; then only `on_error` fires. A source
    /// failure after the first item fires `on_error`, then `on_complete`
    /// with `aborted` set, and the error is returned.
    pub async fn run<S, O, C>(
        &self,
        source: &S,
        pipeline: &Pipeline<S::Item, O>,
        consumer: &mut C,
    ) -> Result<RunStatistics>
    where
        S: Source + ?Sized,
        O: Send + 'static,
        C: Consumer<O> + ?Sized,
    {
        let mut stats = RunStatistics::start();
        let total = source.size_hint();

        info!(
            source = %source.name(),
            stages = %pipeline.stage_names().join(" → "),
            total = ?total,
            "Starting pipeline run"
        );
        self.observer.on_start(source.name());

        let mut stream = source.produce();
        let mut index = 0usize;

        while let Some(next) = stream.next().await {
            let raw = match next {
                Ok(raw) => raw,
                Err(e) => {
                    error!(source = %source.name(), produced = stats.items_produced, error = %e, "Source failed, aborting run");
                    let err = Error::from(e);
                    self.observer.on_error(&err);
                    if stats.items_produced > 0 {
                        stats.aborted = true;
                        stats.finish();
                        self.observer.on_complete(&stats);
                    }
                    return Err(err);
                }
            };
            stats.items_produced += 1;

            match pipeline.run(raw).await {
                Ok(outputs) => {
                    if outputs.is_empty() {
                        debug!(index, "Item filtered out");
                        stats.filtered += 1;
                    }
                    for output in outputs {
                        match consumer.consume(output) {
                            Consumed::Accepted => stats.items_consumed += 1,
                            Consumed::Duplicate => stats.duplicates_filtered += 1,
                        }
                    }
                }
                Err(e) => {
                    warn!(index, error = %e, "Item pipeline pass failed");
                    stats.errors += 1;
                    self.observer.on_error(&Error::from(e));
                }
            }

            self.observer.on_item_processed(index, total);
            index += 1;
        }

        stats.finish();
        self.observer.on_complete(&stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::error::StageError;
    use crate::pipeline::consumer::CollectingConsumer;
    use crate::pipeline::source::IterSource;
    use crate::pipeline::stage::FnStage;

    /// Records every hook call as a string.
    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.events().iter().filter(|e| e.starts_with(prefix)).count()
        }
    }

    impl RunObserver for RecordingObserver {
        fn on_start(&self, source: &str) {
            self.events.lock().unwrap().push(format!("start:{source}"));
        }
        fn on_item_processed(&self, index: usize, total: Option<usize>) {
            self.events.lock().unwrap().push(format!("item:{index}/{total:?}"));
        }
        fn on_error(&self, error: &Error) {
            self.events.lock().unwrap().push(format!("error:{error}"));
        }
        fn on_complete(&self, stats: &RunStatistics) {
            self.events.lock().unwrap().push(format!("complete:{}", stats.items_consumed));
        }
    }

    fn executor() -> (WorkflowExecutor, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        (WorkflowExecutor::new(observer.clone()), observer)
    }

    fn identity() -> Pipeline<u32, u32> {
        Pipeline::new(FnStage::map("identity", |x: u32| x))
    }

    #[tokio::test]
    async fn every_item_reaches_the_consumer() {
        let (executor, observer) = executor();
        let source = IterSource::new("nums", (0..5u32).collect());
        let mut consumer = CollectingConsumer::new();

        let stats = executor.run(&source, &identity(), &mut consumer).await.unwrap();

        assert_eq!(stats.items_produced, 5);
        assert_eq!(stats.items_consumed, 5);
        assert_eq!(stats.errors, 0);
        assert_eq!(consumer.results(), &[0, 1, 2, 3, 4]);
        assert_eq!(observer.count("complete"), 1);
        assert_eq!(observer.events()[0], "start:nums");
        assert!(observer.events().contains(&"item:4/Some(5)".to_string()));
    }

    #[tokio::test]
    async fn filtered_item_is_never_consumed() {
        let (executor, _) = executor();
        let source = IterSource::new("nums", vec![1u32, 2, 3]);
        let pipeline = Pipeline::new(FnStage::filter("drop-two", |x: &u32| *x != 2));
        let mut consumer = CollectingConsumer::new();

        let stats = executor.run(&source, &pipeline, &mut consumer).await.unwrap();

        assert!(stats.items_consumed < stats.items_produced);
        assert_eq!(stats.filtered, 1);
        assert!(!consumer.results().contains(&2));
    }

    #[tokio::test]
    async fn item_failure_is_counted_and_run_continues() {
        let (executor, observer) = executor();
        let source = IterSource::new("nums", vec![1u32, 2, 3]);
        let pipeline = Pipeline::new(FnStage::new("fail-two", |x: u32| async move {
            if x == 2 {
                Err(StageError::Failed {
                    stage: "fail-two".into(),
                    reason: "boom".into(),
                })
            } else {
                Ok(vec![x])
            }
        }));
        let mut consumer = CollectingConsumer::new();

        let stats = executor.run(&source, &pipeline, &mut consumer).await.unwrap();

        assert_eq!(stats.errors, 1);
        assert_eq!(consumer.results(), &[1, 3]);
        assert_eq!(observer.count("error"), 1);
        assert_eq!(observer.count("complete"), 1);
    }

    #[tokio::test]
    async fn duplicates_are_counted() {
        let (executor, _) = executor();
        let source = IterSource::new("nums", vec![7u32, 7, 8]);
        let mut consumer = CollectingConsumer::dedup_by(|x: &u32| x.to_string());

        let stats = executor.run(&source, &identity(), &mut consumer).await.unwrap();

        assert_eq!(stats.items_consumed, 2);
        assert_eq!(stats.duplicates_filtered, 1);
    }

    #[tokio::test]
    async fn source_failure_before_first_item_skips_complete() {
        let (executor, observer) = executor();
        let source = IterSource::failing_at("nums", vec![1u32, 2], 0, "unreachable");
        let mut consumer = CollectingConsumer::new();

        let result = executor.run(&source, &identity(), &mut consumer).await;

        assert!(matches!(result, Err(Error::Source(_))));
        assert_eq!(observer.count("error"), 1);
        assert_eq!(observer.count("complete"), 0);
        assert!(consumer.results().is_empty());
    }

    #[tokio::test]
    async fn source_failure_mid_run_aborts_after_complete() {
        let observer = Arc::new(AbortCapture::default());
        let executor = WorkflowExecutor::new(observer.clone());
        let source = IterSource::failing_at("nums", vec![1u32, 2, 3], 2, "connection reset");
        let mut consumer = CollectingConsumer::new();

        let result = executor.run(&source, &identity(), &mut consumer).await;

        assert!(result.is_err());
        assert_eq!(consumer.results(), &[1, 2]);
        let stats = observer.stats.lock().unwrap().clone().unwrap();
        assert!(stats.aborted);
        assert_eq!(stats.items_produced, 2);
        assert!(stats.finished_at.is_some());
    }

    #[derive(Default)]
    struct AbortCapture {
        stats: Mutex<Option<RunStatistics>>,
    }

    impl RunObserver for AbortCapture {
        fn on_complete(&self, stats: &RunStatistics) {
            *self.stats.lock().unwrap() = Some(stats.clone());
        }
    }

    #[tokio::test]
    async fn empty_source_still_completes() {
        let (executor, observer) = executor();
        let source = IterSource::<u32>::new("empty", vec![]);
        let mut consumer = CollectingConsumer::new();

        let stats = executor.run(&source, &identity(), &mut consumer).await.unwrap();

        assert_eq!(stats.items_produced, 0);
        assert_eq!(observer.count("complete"), 1);
    }
}
