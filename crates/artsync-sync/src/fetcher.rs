use std::sync::Arc;

use artsync_core::{CategoryNode, Record, RecordReference};
use artsync_storage::SourceStore;
use tracing::{debug, warn};

use crate::closure::resolve_exposure_set;
use crate::error::FetchError;

/// Loads full records from the source store.
#[derive(Clone)]
pub struct RecordFetcher {
    source: Arc<dyn SourceStore>,
}

impl RecordFetcher {
    pub fn new(source: Arc<dyn SourceStore>) -> Self {
        Self { source }
    }

    pub async fn fetch(&self, reference: &RecordReference) -> Result<Record, FetchError> {
        self.fetch_with_exposure(&reference.id, None).await
    }

    /// With `exposure` set, the closure resolver is skipped and the given columns are used as is
    /// (sorted and deduplicated by id).
    pub async fn fetch_with_exposure(
        &self,
        article_id: &str,
        exposure: Option<Vec<CategoryNode>>,
    ) -> Result<Record, FetchError> {
        let mut record = self
            .source
            .fetch_record(article_id)
            .await
            .map_err(|source| FetchError::QueryFailed {
                id: article_id.to_string(),
                source,
            })?
            .ok_or_else(|| FetchError::NotFound(article_id.to_string()))?;

        record.content = match self.source.fetch_content(article_id).await {
            Ok(chunks) => chunks.concat(),
            Err(err) => {
                warn!(article_id, error = %err, "content fetch failed, continuing with empty body");
                String::new()
            }
        };

        record.attachments = match self.source.fetch_attachments(article_id).await {
            Ok(attachments) => attachments,
            Err(err) => {
                warn!(article_id, error = %err, "attachment fetch failed");
                Vec::new()
            }
        };

        record.exposure = match exposure {
            Some(mut explicit) => {
                explicit.sort_by_key(|c| c.id);
                explicit.dedup_by_key(|c| c.id);
                explicit
            }
            None => resolve_exposure_set(&*self.source, &record.folder_id, &record.id).await,
        };

        debug!(
            article_id,
            columns = record.exposure.len(),
            attachments = record.attachments.len(),
            "record fetched"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use artsync_core::{Attachment, MirrorKind};
    use artsync_storage::MemorySource;

    use super::*;

    fn source() -> MemorySource {
        let mut source = MemorySource::new();
        source.insert_record(Record {
            id: "42".into(),
            folder_id: "7".into(),
            site_id: "100".into(),
            title: "Hello".into(),
            attachments: vec![Attachment {
                name: "a.pdf".into(),
                path: "/a.pdf".into(),
            }],
            ..Default::default()
        });
        source.set_content_chunks("42", vec!["<p>one</p>".into(), "<p>two</p>".into()]);
        source.set_unique_folder_column(7, CategoryNode::new(10, "News"));
        source.add_mirror(10, MirrorKind::Column, CategoryNode::new(20, "Home"));
        source
    }

    #[tokio::test]
    async fn fetch_concatenates_content_and_resolves_exposure() {
        let fetcher = RecordFetcher::new(Arc::new(source()));
        let record = fetcher.fetch(&RecordReference::new("42")).await.unwrap();
        assert_eq!(record.content, "<p>one</p><p>two</p>");
        assert_eq!(record.exposure_ids(), vec![10, 20]);
        assert_eq!(record.attachments.len(), 1);
    }

    #[tokio::test]
    async fn content_failure_is_not_fatal() {
        let mut source = source();
        source.fail_content("42");
        let fetcher = RecordFetcher::new(Arc::new(source));
        let record = fetcher.fetch(&RecordReference::new("42")).await.unwrap();
        assert_eq!(record.content, "");
        assert_eq!(record.title, "Hello");
    }

    #[tokio::test]
    async fn explicit_exposure_skips_resolution() {
        let fetcher = RecordFetcher::new(Arc::new(source()));
        let record = fetcher
            .fetch_with_exposure("42", Some(vec![CategoryNode::new(55, "Events")]))
            .await
            .unwrap();
        assert_eq!(record.exposure, vec![CategoryNode::new(55, "Events")]);
    }

    #[tokio::test]
    async fn missing_and_failing_records_are_distinguished() {
        let mut source = source();
        source.fail_record("13");
        let fetcher = RecordFetcher::new(Arc::new(source));
        assert!(matches!(
            fetcher.fetch(&RecordReference::new("99")).await,
            Err(FetchError::NotFound(id)) if id == "99"
        ));
        assert!(matches!(
            fetcher.fetch(&RecordReference::new("13")).await,
            Err(FetchError::QueryFailed { .. })
        ));
    }
}
