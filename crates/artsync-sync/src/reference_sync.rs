//! Keeps the destination copies of the column and site tables in step with the source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use artsync_core::{diff_by_id, TableDiff};
use artsync_storage::{DestinationStore, SourceStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ReferenceSyncError;

/// Parent assigned to columns whose legacy parent is missing.
pub const ROOT_COLUMN_ID: i64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffCounts {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl<T> From<&TableDiff<T>> for DiffCounts {
    fn from(diff: &TableDiff<T>) -> Self {
        Self {
            added: diff.added.len(),
            updated: diff.updated.len(),
            deleted: diff.deleted.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReferenceSyncReport {
    pub columns: DiffCounts,
    pub sites: DiffCounts,
    pub elapsed: Duration,
}

pub struct ReferenceSync {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Accepts both 5-field and 6-field (leading seconds) expressions.
fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

impl ReferenceSync {
    pub fn new(source: Arc<dyn SourceStore>, destination: Arc<dyn DestinationStore>) -> Self {
        Self {
            source,
            destination,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// One full reconciliation. A concurrent call fails fast with `AlreadyRunning`.
    pub async fn run_once(&self) -> Result<ReferenceSyncReport, ReferenceSyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("reference sync already in progress, skipping");
            return Err(ReferenceSyncError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        let clock = Instant::now();

        let mut source_columns = self.source.list_columns().await.map_err(|source| {
            ReferenceSyncError::Load {
                table: "t_column",
                side: "source",
                source,
            }
        })?;
        for column in &mut source_columns {
            if column.parent_id == 0 {
                column.parent_id = ROOT_COLUMN_ID;
            }
        }
        let dest_columns = self.destination.load_columns().await.map_err(|source| {
            ReferenceSyncError::Load {
                table: "t_column",
                side: "destination",
                source,
            }
        })?;
        let source_sites = self.source.list_sites().await.map_err(|source| ReferenceSyncError::Load {
            table: "t_site",
            side: "source",
            source,
        })?;
        let dest_sites = self
            .destination
            .load_sites()
            .await
            .map_err(|source| ReferenceSyncError::Load {
                table: "t_site",
                side: "destination",
                source,
            })?;

        let column_diff = diff_by_id(source_columns, dest_columns);
        let site_diff = diff_by_id(source_sites, dest_sites);

        if !column_diff.is_empty() || !site_diff.is_empty() {
            self.destination
                .apply_reference_diff(&column_diff, &site_diff)
                .await
                .map_err(ReferenceSyncError::Apply)?;
        }

        let report = ReferenceSyncReport {
            columns: DiffCounts::from(&column_diff),
            sites: DiffCounts::from(&site_diff),
            elapsed: clock.elapsed(),
        };
        info!(
            columns_added = report.columns.added,
            columns_updated = report.columns.updated,
            columns_deleted = report.columns.deleted,
            sites_added = report.sites.added,
            sites_updated = report.sites.updated,
            sites_deleted = report.sites.deleted,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "reference tables synced"
        );
        Ok(report)
    }

    pub async fn build_scheduler(self: &Arc<Self>, cron: &str) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = normalize_cron(cron);
        let sync = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let sync = sync.clone();
            Box::pin(async move {
                match sync.run_once().await {
                    Ok(_) | Err(ReferenceSyncError::AlreadyRunning) => {}
                    Err(err) => error!(error = %err, "scheduled reference sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }

    /// Runs on `cron` until `cancel` fires.
    pub async fn run_scheduled(self: Arc<Self>, cron: &str, cancel: CancellationToken) -> Result<()> {
        let mut sched = self.build_scheduler(cron).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron, "reference sync scheduled");
        cancel.cancelled().await;
        sched.shutdown().await.context("stopping scheduler")?;
        info!("reference sync schedule stopped");
        Ok(())
    }
}
