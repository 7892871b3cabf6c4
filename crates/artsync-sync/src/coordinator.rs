//! Bounded-parallel execution of reference batches.

use std::sync::Arc;

use artsync_core::{BatchResult, RecordReference};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::batch::BatchProcessor;
use crate::config::{ConcurrencyStrategy, ResolvedParams};
use crate::progress::ProgressTracker;
use crate::retry::{process_with_retry, RetryPolicy};

/// Upper bound on parallel batches, whatever the configured concurrency.
pub const MAX_CONCURRENCY: usize = 32;

/// Splits `refs` into consecutive batches of `batch_size`; only the last may be shorter.
pub fn partition(refs: &[RecordReference], batch_size: usize) -> Vec<Vec<RecordReference>> {
    refs.chunks(batch_size.max(1)).map(<[_]>::to_vec).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorReport {
    pub result: BatchResult,
    pub total_batches: usize,
    pub completed_batches: usize,
    /// Batches never handed to a processor because the run was cancelled first.
    pub undelivered_batches: usize,
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct Coordinator {
    processor: Arc<dyn BatchProcessor>,
    retry: RetryPolicy,
}

type QueuedBatch = (usize, Vec<RecordReference>);

async fn run_batch(
    processor: &dyn BatchProcessor,
    batch: &[RecordReference],
    retry: &RetryPolicy,
    batch_id: usize,
) -> BatchResult {
    let span = info_span!("batch", batch_id, size = batch.len());
    match process_with_retry(processor, batch, retry, batch_id)
        .instrument(span)
        .await
    {
        Ok(result) => result,
        Err(err) => {
            error!(batch_id, size = batch.len(), error = %err, "batch exhausted retries, counting every item as failed");
            BatchResult::all_failed(batch.len())
        }
    }
}

impl Coordinator {
    pub fn new(processor: Arc<dyn BatchProcessor>, retry: RetryPolicy) -> Self {
        Self { processor, retry }
    }

    /// Returns once every submitted batch has finished. Cancellation stops submission of new
    /// batches; batches already running are left to complete.
    pub async fn run(
        &self,
        refs: &[RecordReference],
        params: &ResolvedParams,
        cancel: &CancellationToken,
    ) -> CoordinatorReport {
        let batches = partition(refs, params.batch_size);
        let total_batches = batches.len();
        let tracker = Arc::new(ProgressTracker::new(total_batches));
        let concurrency = params.effective_concurrency().min(total_batches.max(1));

        info!(
            references = refs.len(),
            batches = total_batches,
            concurrency,
            strategy = ?params.strategy,
            "dispatching batches"
        );

        let undelivered_batches = match params.strategy {
            ConcurrencyStrategy::WorkerPool => {
                self.run_worker_pool(batches, concurrency, params.worker_pool_size, &tracker, cancel)
                    .await
            }
            ConcurrencyStrategy::Semaphore => {
                self.run_semaphore(batches, concurrency, &tracker, cancel).await
            }
        };
        if undelivered_batches > 0 {
            warn!(
                undelivered = undelivered_batches,
                total = total_batches,
                "run cancelled with batches never processed"
            );
        }

        let state = tracker.snapshot();
        CoordinatorReport {
            result: state.result(),
            total_batches,
            completed_batches: state.completed_batches,
            undelivered_batches,
            cancelled: cancel.is_cancelled() && state.completed_batches < total_batches,
        }
    }

    async fn run_worker_pool(
        &self,
        batches: Vec<Vec<RecordReference>>,
        concurrency: usize,
        queue_capacity: usize,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> usize {
        let total = batches.len();
        let mut submitted = 0;
        let (batch_tx, batch_rx) = mpsc::channel::<QueuedBatch>(queue_capacity.max(1));
        let batch_rx = Arc::new(Mutex::new(batch_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<BatchResult>(queue_capacity.max(1));

        let aggregator = tokio::spawn({
            let tracker = tracker.clone();
            async move {
                while let Some(result) = result_rx.recv().await {
                    tracker.update(&result);
                }
            }
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let batch_rx = batch_rx.clone();
            let result_tx = result_tx.clone();
            let processor = self.processor.clone();
            let retry = self.retry;
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!(worker_id, "worker stopping on cancellation");
                        break;
                    }
                    let next = batch_rx.lock().await.recv().await;
                    let Some((batch_id, batch)) = next else {
                        break;
                    };
                    let result = run_batch(&*processor, &batch, &retry, batch_id).await;
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for (batch_id, batch) in batches.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(batch_id, "cancelled, no further batches submitted");
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(batch_id, "cancelled, no further batches submitted");
                    break;
                }
                sent = batch_tx.send((batch_id, batch)) => {
                    if sent.is_err() {
                        break;
                    }
                    submitted += 1;
                }
            }
        }
        drop(batch_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task failed");
            }
        }
        if let Err(err) = aggregator.await {
            error!(error = %err, "result aggregator failed");
        }

        // Workers stop on cancellation without draining the queue.
        let mut queued = 0;
        let mut rx = batch_rx.lock().await;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        total - submitted + queued
    }

    async fn run_semaphore(
        &self,
        batches: Vec<Vec<RecordReference>>,
        concurrency: usize,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> usize {
        let total = batches.len();
        let mut submitted = 0;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        for (batch_id, batch) in batches.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(batch_id, "cancelled, no further batches submitted");
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(batch_id, "cancelled, no further batches submitted");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let processor = self.processor.clone();
            let retry = self.retry;
            let tracker = tracker.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = run_batch(&*processor, &batch, &retry, batch_id).await;
                tracker.update(&result);
            });
            submitted += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "batch task failed");
            }
        }
        total - submitted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::BatchError;

    fn refs(n: usize) -> Vec<RecordReference> {
        (0..n).map(|i| RecordReference::new(i.to_string())).collect()
    }

    fn params(batch_size: usize, concurrency: usize, strategy: ConcurrencyStrategy) -> ResolvedParams {
        ResolvedParams {
            filter: Default::default(),
            batch_size,
            concurrency,
            worker_pool_size: concurrency * 2,
            strategy,
        }
    }

    /// Every id divisible by 3 is skipped, by 7 fails, otherwise processed.
    #[derive(Default)]
    struct Classifying {
        seen: std::sync::Mutex<Vec<usize>>,
    }

    fn classify(batch: &[RecordReference]) -> BatchResult {
        let mut result = BatchResult::default();
        for r in batch {
            let n: usize = r.id.parse().unwrap();
            if n % 3 == 0 {
                result.skipped += 1;
            } else if n % 7 == 0 {
                result.errors += 1;
            } else {
                result.processed += 1;
            }
        }
        result
    }

    #[async_trait]
    impl BatchProcessor for Classifying {
        async fn process_batch(&self, refs: &[RecordReference]) -> Result<BatchResult, BatchError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.seen
                .lock()
                .unwrap()
                .extend(refs.iter().map(|r| r.id.parse::<usize>().unwrap()));
            Ok(classify(refs))
        }
    }

    #[test]
    fn partition_preserves_order_and_sizes() {
        for (n, size) in [(0, 5), (1, 5), (10, 5), (11, 5), (1350, 500), (7, 1)] {
            let input = refs(n);
            let batches = partition(&input, size);
            assert_eq!(batches.len(), n.div_ceil(size));
            if let Some((last, full)) = batches.split_last() {
                assert!(full.iter().all(|b| b.len() == size));
                assert!(!last.is_empty() && last.len() <= size);
            }
            let flat: Vec<_> = batches.concat();
            assert_eq!(flat, input);
        }
        let sizes: Vec<_> = partition(&refs(1350), 500).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![500, 500, 350]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn aggregate_is_the_sum_of_batches_for_every_shape() {
        let input = refs(997);
        let expected: BatchResult = partition(&input, 37).iter().map(|b| classify(b)).sum();

        for strategy in [ConcurrencyStrategy::WorkerPool, ConcurrencyStrategy::Semaphore] {
            for concurrency in [1, 3, 8, 64] {
                let processor = Arc::new(Classifying::default());
                let coordinator = Coordinator::new(processor.clone(), RetryPolicy::default());
                let report = coordinator
                    .run(&input, &params(37, concurrency, strategy), &CancellationToken::new())
                    .await;

                assert_eq!(report.result, expected, "{strategy:?} x{concurrency}");
                assert_eq!(report.total_batches, 27);
                assert_eq!(report.completed_batches, 27);
                assert_eq!(report.undelivered_batches, 0);
                assert!(!report.cancelled);

                let mut seen = processor.seen.lock().unwrap().clone();
                seen.sort_unstable();
                assert_eq!(seen, (0..997).collect::<Vec<_>>(), "each batch exactly once");
            }
        }
    }

    #[tokio::test]
    async fn scenario_1350_references_in_three_batches() {
        struct AllGood;
        #[async_trait]
        impl BatchProcessor for AllGood {
            async fn process_batch(&self, refs: &[RecordReference]) -> Result<BatchResult, BatchError> {
                Ok(BatchResult {
                    processed: refs.len(),
                    ..Default::default()
                })
            }
        }

        let coordinator = Coordinator::new(Arc::new(AllGood), RetryPolicy::default());
        let report = coordinator
            .run(&refs(1350), &params(500, 4, ConcurrencyStrategy::WorkerPool), &CancellationToken::new())
            .await;
        assert_eq!(report.total_batches, 3);
        assert_eq!(report.result, BatchResult { processed: 1350, skipped: 0, errors: 0 });
    }

    #[tokio::test]
    async fn exhausted_batches_count_entirely_as_errors() {
        struct FailsOddBatches {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl BatchProcessor for FailsOddBatches {
            async fn process_batch(&self, refs: &[RecordReference]) -> Result<BatchResult, BatchError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if refs[0].id.parse::<usize>().unwrap() % 20 == 10 {
                    return Err(BatchError::Invocation("source went away".into()));
                }
                Ok(BatchResult {
                    processed: refs.len(),
                    ..Default::default()
                })
            }
        }

        for strategy in [ConcurrencyStrategy::WorkerPool, ConcurrencyStrategy::Semaphore] {
            let processor = Arc::new(FailsOddBatches {
                calls: AtomicUsize::new(0),
            });
            let coordinator = Coordinator::new(processor.clone(), RetryPolicy::default());
            let report = coordinator
                .run(&refs(45), &params(10, 2, strategy), &CancellationToken::new())
                .await;
            // batches starting at 10 and 30 fail every attempt
            assert_eq!(report.result, BatchResult { processed: 25, skipped: 0, errors: 20 });
            assert_eq!(processor.calls.load(Ordering::SeqCst), 3 + 2 * 3);
        }
    }

    #[tokio::test]
    async fn cancellation_stops_new_submissions() {
        struct CancelsOnFirstCall {
            cancel: CancellationToken,
            calls: AtomicUsize,
        }
        #[async_trait]
        impl BatchProcessor for CancelsOnFirstCall {
            async fn process_batch(&self, refs: &[RecordReference]) -> Result<BatchResult, BatchError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.cancel.cancel();
                Ok(BatchResult {
                    processed: refs.len(),
                    ..Default::default()
                })
            }
        }

        for strategy in [ConcurrencyStrategy::WorkerPool, ConcurrencyStrategy::Semaphore] {
            let cancel = CancellationToken::new();
            let processor = Arc::new(CancelsOnFirstCall {
                cancel: cancel.clone(),
                calls: AtomicUsize::new(0),
            });
            let coordinator = Coordinator::new(processor.clone(), RetryPolicy::default());
            let report = coordinator.run(&refs(100), &params(5, 1, strategy), &cancel).await;

            assert!(report.cancelled, "{strategy:?}");
            assert!(report.completed_batches < report.total_batches);
            assert!(report.undelivered_batches > 0);
            assert_eq!(
                report.completed_batches + report.undelivered_batches,
                report.total_batches,
                "{strategy:?}: every batch either ran or is reported undelivered"
            );
            assert_eq!(report.completed_batches, processor.calls.load(Ordering::SeqCst));
            assert_eq!(report.result.processed, report.completed_batches * 5);
        }
    }

    #[tokio::test]
    async fn each_batch_runs_inside_its_own_span() {
        use tracing_subscriber::prelude::*;

        struct RecordsSpan {
            spans: std::sync::Mutex<Vec<Option<&'static str>>>,
        }
        #[async_trait]
        impl BatchProcessor for RecordsSpan {
            async fn process_batch(&self, refs: &[RecordReference]) -> Result<BatchResult, BatchError> {
                let span = tracing::Span::current();
                let name = span.metadata().map(|m| m.name());
                assert!(span.field("batch_id").is_some());
                assert!(span.field("size").is_some());
                self.spans.lock().unwrap().push(name);
                Ok(BatchResult {
                    processed: refs.len(),
                    ..Default::default()
                })
            }
        }

        // The default test runtime is single-threaded, so the thread-local subscriber sees
        // every batch.
        let _guard = tracing_subscriber::registry().set_default();
        let processor = Arc::new(RecordsSpan {
            spans: std::sync::Mutex::new(Vec::new()),
        });
        let coordinator = Coordinator::new(processor.clone(), RetryPolicy::default());
        for strategy in [ConcurrencyStrategy::WorkerPool, ConcurrencyStrategy::Semaphore] {
            coordinator
                .run(&refs(9), &params(4, 2, strategy), &CancellationToken::new())
                .await;
        }
        let spans = processor.spans.lock().unwrap().clone();
        assert_eq!(spans, vec![Some("batch"); 6]);
    }

    #[tokio::test]
    async fn already_cancelled_run_submits_nothing() {
        let processor = Arc::new(Classifying::default());
        let coordinator = Coordinator::new(processor.clone(), RetryPolicy::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = coordinator
            .run(&refs(10), &params(2, 2, ConcurrencyStrategy::Semaphore), &cancel)
            .await;
        assert_eq!(report.completed_batches, 0);
        assert_eq!(report.undelivered_batches, 5);
        assert!(report.cancelled);
        assert!(processor.seen.lock().unwrap().is_empty());
    }
}
