use std::fmt;
use std::sync::Arc;

use artsync_core::{ArticleWrite, ExposureRow, Record};
use artsync_storage::{parse_id, DestinationStore, SourceStore};
use tracing::{debug, warn};

use crate::enricher::RecordEnricher;
use crate::error::WriteError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Processed,
    Skipped,
    Failed(String),
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Processed => f.write_str("processed"),
            ApplyOutcome::Skipped => f.write_str("skipped"),
            ApplyOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Applies enriched records to the destination store.
#[derive(Clone)]
pub struct DestinationWriter {
    destination: Arc<dyn DestinationStore>,
    source: Arc<dyn SourceStore>,
    enricher: RecordEnricher,
}

impl DestinationWriter {
    pub fn new(
        destination: Arc<dyn DestinationStore>,
        source: Arc<dyn SourceStore>,
        enricher: RecordEnricher,
    ) -> Self {
        Self {
            destination,
            source,
            enricher,
        }
    }

    pub fn destination(&self) -> &Arc<dyn DestinationStore> {
        &self.destination
    }

    /// Idempotent apply: an article already present is skipped without touching storage.
    pub async fn apply(&self, record: &Record) -> ApplyOutcome {
        let article_id = match parse_id(&record.id) {
            Ok(id) => id,
            Err(_) => return ApplyOutcome::Failed(WriteError::InvalidId(record.id.clone()).to_string()),
        };

        match self.destination.contains(article_id).await {
            Ok(true) => {
                debug!(article_id, "article already present, skipping");
                return ApplyOutcome::Skipped;
            }
            Ok(false) => {}
            Err(err) => return ApplyOutcome::Failed(format!("existence check: {err}")),
        }

        match self.replace(record).await {
            Ok(()) => ApplyOutcome::Processed,
            Err(err) => ApplyOutcome::Failed(err.to_string()),
        }
    }

    /// Unconditional delete-then-insert of the article and its association and attachment rows.
    pub async fn replace(&self, record: &Record) -> Result<(), WriteError> {
        let article_id = parse_id(&record.id).map_err(|_| WriteError::InvalidId(record.id.clone()))?;
        let exposures = self.exposure_rows(article_id, record).await;
        self.destination
            .replace_article(&ArticleWrite {
                article_id,
                record,
                exposures,
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, article_id: i64) -> Result<(), WriteError> {
        self.destination.delete_article(article_id).await?;
        Ok(())
    }

    /// One association row per exposure entry, each carrying its column's site and page URL.
    pub async fn exposure_rows(&self, article_id: i64, record: &Record) -> Vec<ExposureRow> {
        let mut rows = Vec::with_capacity(record.exposure.len());
        for node in &record.exposure {
            let site_id = self
                .enricher
                .site_of_column(node)
                .await
                .unwrap_or_else(|| record.site_id.clone());

            let (site_name, url) = if site_id == record.site_id {
                (record.site_name.clone(), record.access_url.clone())
            } else {
                let name = match self.source.site_name(&site_id).await {
                    Ok(name) => name.unwrap_or_default(),
                    Err(err) => {
                        warn!(article_id, site_id = %site_id, error = %err, "site name lookup failed");
                        String::new()
                    }
                };
                let url = self
                    .enricher
                    .column_url(record, &site_id, node.id)
                    .await
                    .or_else(|| record.access_url.clone());
                (name, url)
            };

            rows.push(ExposureRow {
                article_id,
                column_id: node.id,
                column_name: node.name.clone(),
                site_id,
                site_name,
                url,
            });
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use artsync_core::{Attachment, CategoryNode, ColumnRow, SiteInfo};
    use artsync_storage::{MemoryDestination, MemorySource};

    use super::*;

    fn source() -> MemorySource {
        let mut source = MemorySource::new();
        source.add_site(
            "100",
            "Main",
            SiteInfo {
                domain_name: "www.a.edu".into(),
                ..Default::default()
            },
        );
        source.add_site(
            "200",
            "Library",
            SiteInfo {
                domain_name: "lib.a.edu".into(),
                ..Default::default()
            },
        );
        source.add_column(ColumnRow {
            id: 10,
            site_id: 100,
            name: "News".into(),
            ..Default::default()
        });
        source.add_column(ColumnRow {
            id: 20,
            site_id: 200,
            name: "Home".into(),
            ..Default::default()
        });
        source
    }

    fn record(id: &str) -> Record {
        Record {
            id: id.into(),
            site_id: "100".into(),
            site_name: "Main".into(),
            title: "Hello".into(),
            create_time: "2025-04-27".into(),
            access_url: Some(format!("http://www.a.edu/2025/0427/c10a{id}/page.htm")),
            exposure: vec![CategoryNode::new(10, "News"), CategoryNode::new(20, "Home")],
            attachments: vec![Attachment {
                name: "a.pdf".into(),
                path: "http://www.a.edu/a.pdf".into(),
            }],
            ..Default::default()
        }
    }

    fn writer(dest: Arc<MemoryDestination>) -> DestinationWriter {
        let source: Arc<dyn SourceStore> = Arc::new(source());
        DestinationWriter::new(dest, source.clone(), RecordEnricher::new(source))
    }

    #[tokio::test]
    async fn apply_twice_is_processed_then_skipped_with_identical_state() {
        let dest = Arc::new(MemoryDestination::new());
        let writer = writer(dest.clone());
        let rec = record("7");

        assert_eq!(writer.apply(&rec).await, ApplyOutcome::Processed);
        let after_first = dest.snapshot().await;
        assert_eq!(writer.apply(&rec).await, ApplyOutcome::Skipped);
        assert_eq!(dest.snapshot().await, after_first);
        assert_eq!(dest.write_count().await, 1);
    }

    #[tokio::test]
    async fn existing_article_42_is_skipped_without_changes() {
        let dest = Arc::new(MemoryDestination::new());
        let writer = writer(dest.clone());
        let existing = record("42");
        writer.replace(&existing).await.unwrap();
        let before = dest.snapshot().await;

        let mut changed = record("42");
        changed.title = "Edited".into();
        assert_eq!(writer.apply(&changed).await, ApplyOutcome::Skipped);
        assert_eq!(dest.snapshot().await, before);
        assert_eq!(dest.write_count().await, 1);
    }

    #[tokio::test]
    async fn association_rows_carry_each_columns_site_and_url() {
        let dest = Arc::new(MemoryDestination::new());
        let writer = writer(dest.clone());
        writer.apply(&record("7")).await;

        let snap = dest.snapshot().await;
        let rows = &snap.associations[&7];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].site_name, "Main");
        assert_eq!(rows[0].url.as_deref(), Some("http://www.a.edu/2025/0427/c10a7/page.htm"));
        assert_eq!(rows[1].site_id, "200");
        assert_eq!(rows[1].site_name, "Library");
        assert_eq!(rows[1].url.as_deref(), Some("http://lib.a.edu/2025/0427/c20a7/page.htm"));
        assert_eq!(snap.attachments[&7].len(), 1);
    }

    #[tokio::test]
    async fn store_failure_becomes_failed_outcome_with_no_partial_rows() {
        let dest = Arc::new(MemoryDestination::new());
        dest.fail_writes_for(8).await;
        let writer = writer(dest.clone());

        let outcome = writer.apply(&record("8")).await;
        assert!(matches!(outcome, ApplyOutcome::Failed(reason) if reason.contains("article 8")));
        assert!(dest.snapshot().await.articles.is_empty());
    }

    #[tokio::test]
    async fn non_numeric_id_fails() {
        let dest = Arc::new(MemoryDestination::new());
        let writer = writer(dest);
        assert!(matches!(writer.apply(&record("x1")).await, ApplyOutcome::Failed(_)));
    }
}
