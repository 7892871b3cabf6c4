use std::sync::Arc;

use artsync_core::{BatchResult, RecordReference};
use artsync_storage::{parse_id, DestinationStore, SourceStore};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::enricher::RecordEnricher;
use crate::error::BatchError;
use crate::fetcher::RecordFetcher;
use crate::writer::{ApplyOutcome, DestinationWriter};

/// Processes one batch of references. An `Err` means the whole invocation failed and may be
/// retried; per-item failures are counted in the returned result instead.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, refs: &[RecordReference]) -> Result<BatchResult, BatchError>;
}

/// Fetch, enrich and apply, one reference at a time.
#[derive(Clone)]
pub struct ArticlePipeline {
    fetcher: RecordFetcher,
    enricher: RecordEnricher,
    writer: DestinationWriter,
}

impl ArticlePipeline {
    pub fn new(source: Arc<dyn SourceStore>, destination: Arc<dyn DestinationStore>) -> Self {
        let enricher = RecordEnricher::new(source.clone());
        Self {
            fetcher: RecordFetcher::new(source.clone()),
            writer: DestinationWriter::new(destination, source, enricher.clone()),
            enricher,
        }
    }

    pub fn fetcher(&self) -> &RecordFetcher {
        &self.fetcher
    }

    pub fn enricher(&self) -> &RecordEnricher {
        &self.enricher
    }

    pub fn writer(&self) -> &DestinationWriter {
        &self.writer
    }

    /// Standalone single-record apply, outside any batch.
    pub async fn apply_reference(&self, reference: &RecordReference) -> ApplyOutcome {
        if let Ok(id) = parse_id(&reference.id) {
            match self.writer.destination().contains(id).await {
                Ok(true) => return ApplyOutcome::Skipped,
                Ok(false) => {}
                Err(err) => return ApplyOutcome::Failed(format!("existence check: {err}")),
            }
        }

        let record = match self.fetcher.fetch(reference).await {
            Ok(record) => record,
            Err(err) => return ApplyOutcome::Failed(err.to_string()),
        };
        let record = match self.enricher.enrich(record).await {
            Ok(record) => record,
            Err(err) => return ApplyOutcome::Failed(err.to_string()),
        };
        self.writer.apply(&record).await
    }
}

#[async_trait]
impl BatchProcessor for ArticlePipeline {
    async fn process_batch(&self, refs: &[RecordReference]) -> Result<BatchResult, BatchError> {
        let mut result = BatchResult::default();
        for reference in refs {
            match self.apply_reference(reference).await {
                ApplyOutcome::Processed => result.processed += 1,
                ApplyOutcome::Skipped => result.skipped += 1,
                ApplyOutcome::Failed(reason) => {
                    warn!(article_id = %reference.id, %reason, "article failed");
                    result.errors += 1;
                }
            }
        }
        debug!(
            size = refs.len(),
            processed = result.processed,
            skipped = result.skipped,
            errors = result.errors,
            "batch processed"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use artsync_core::{CategoryNode, Record};
    use artsync_storage::{MemoryDestination, MemorySource};

    use super::*;

    fn source_with(ids: &[&str]) -> MemorySource {
        let mut source = MemorySource::new();
        for id in ids {
            source.insert_record(Record {
                id: id.to_string(),
                folder_id: "7".into(),
                site_id: "100".into(),
                ..Default::default()
            });
        }
        source.set_unique_folder_column(7, CategoryNode::new(10, "News"));
        source
    }

    #[tokio::test]
    async fn outcomes_are_classified_per_item() {
        let mut source = source_with(&["1", "2", "3"]);
        source.fail_record("3");
        let dest = Arc::new(MemoryDestination::new());
        let pipeline = ArticlePipeline::new(Arc::new(source), dest.clone());

        let first = pipeline.process_batch(&[RecordReference::new("1")]).await.unwrap();
        assert_eq!(first, BatchResult { processed: 1, skipped: 0, errors: 0 });

        let refs = ["1", "2", "3", "404"].map(RecordReference::new);
        let result = pipeline.process_batch(&refs).await.unwrap();
        assert_eq!(result, BatchResult { processed: 1, skipped: 1, errors: 2 });

        let snap = dest.snapshot().await;
        assert_eq!(snap.articles.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(snap.associations[&2][0].column_id, 10);
    }

    #[tokio::test]
    async fn standalone_apply_matches_batch_semantics() {
        let dest = Arc::new(MemoryDestination::new());
        let pipeline = ArticlePipeline::new(Arc::new(source_with(&["5"])), dest);
        let reference = RecordReference::new("5");
        assert_eq!(pipeline.apply_reference(&reference).await, ApplyOutcome::Processed);
        assert_eq!(pipeline.apply_reference(&reference).await, ApplyOutcome::Skipped);
    }
}
