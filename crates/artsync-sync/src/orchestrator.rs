use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use artsync_core::{BatchResult, RecordReference};
use artsync_storage::{DestinationStore, SourceStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::batch::{ArticlePipeline, BatchProcessor};
use crate::config::{MigrationConfig, ResolvedParams, RunParams};
use crate::coordinator::Coordinator;
use crate::error::MigrationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_references: usize,
    pub total_batches: usize,
    pub completed_batches: usize,
    pub result: BatchResult,
    pub cancelled: bool,
}

/// Owns the store handles and settings for bulk recovery runs.
pub struct Orchestrator {
    source: Arc<dyn SourceStore>,
    processor: Arc<dyn BatchProcessor>,
    config: MigrationConfig,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        config: MigrationConfig,
    ) -> Self {
        let processor = Arc::new(ArticlePipeline::new(source.clone(), destination));
        Self::with_processor(source, processor, config)
    }

    pub fn with_processor(
        source: Arc<dyn SourceStore>,
        processor: Arc<dyn BatchProcessor>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            source,
            processor,
            config,
        }
    }

    /// Only parameter validation and reference enumeration can fail the run; item and batch
    /// failures are reported in the summary counts.
    pub async fn run(
        &self,
        params: &RunParams,
        cancel: CancellationToken,
    ) -> Result<MigrationSummary, MigrationError> {
        let resolved = params.resolve()?;
        let run_id = Uuid::new_v4();
        let span = info_span!("migration", %run_id);
        self.run_resolved(resolved, run_id, cancel).instrument(span).await
    }

    async fn run_resolved(
        &self,
        resolved: ResolvedParams,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<MigrationSummary, MigrationError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let listed = self
            .source
            .list_references(&resolved.filter, self.config.page_size)
            .await
            .map_err(MigrationError::Enumerate)?;
        let refs = dedup_references(listed);
        info!(
            references = refs.len(),
            site_id = resolved.filter.site_id.as_deref().unwrap_or("*"),
            column_id = resolved.filter.column_id.as_deref().unwrap_or("*"),
            "references enumerated"
        );

        if refs.is_empty() {
            info!("nothing to migrate");
            return Ok(MigrationSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                total_references: 0,
                total_batches: 0,
                completed_batches: 0,
                result: BatchResult::default(),
                cancelled: false,
            });
        }

        let coordinator = Coordinator::new(self.processor.clone(), self.config.retry_policy());
        let report = coordinator.run(&refs, &resolved, &cancel).await;

        info!(
            total = refs.len(),
            processed = report.result.processed,
            skipped = report.result.skipped,
            errors = report.result.errors,
            cancelled = report.cancelled,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "migration finished"
        );

        Ok(MigrationSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_references: refs.len(),
            total_batches: report.total_batches,
            completed_batches: report.completed_batches,
            result: report.result,
            cancelled: report.cancelled,
        })
    }
}

/// An article listed once per column it belongs to is migrated once, at its first position.
fn dedup_references(refs: Vec<RecordReference>) -> Vec<RecordReference> {
    let mut seen = HashSet::with_capacity(refs.len());
    refs.into_iter().filter(|r| seen.insert(r.id.clone())).collect()
}
