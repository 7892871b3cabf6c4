//! Migration pipeline: closure resolution, fetch, enrich, idempotent apply, batched and bounded
//! parallel execution, plus the single-article event path and reference table sync.

use std::sync::Arc;

use anyhow::{Context, Result};
use artsync_storage::{DestinationStore, MySqlSource, PgDestination, SourceStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod batch;
pub mod closure;
pub mod config;
pub mod coordinator;
pub mod enricher;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod orchestrator;
pub mod progress;
pub mod reference_sync;
pub mod retry;
pub mod writer;

pub use batch::{ArticlePipeline, BatchProcessor};
pub use closure::resolve_exposure_set;
pub use config::{ConcurrencyStrategy, MigrationConfig, ResolvedParams, RunParams};
pub use coordinator::{partition, Coordinator, CoordinatorReport, MAX_CONCURRENCY};
pub use enricher::RecordEnricher;
pub use error::{BatchError, EnrichError, EventError, FetchError, MigrationError, ReferenceSyncError, WriteError};
pub use events::{ArticleEvent, EventHandler, EventOutcome};
pub use fetcher::RecordFetcher;
pub use orchestrator::{MigrationSummary, Orchestrator};
pub use progress::{ProgressState, ProgressTracker};
pub use reference_sync::{ReferenceSync, ReferenceSyncReport};
pub use retry::{process_with_retry, RetryPolicy};
pub use writer::{ApplyOutcome, DestinationWriter};

pub const CRATE_NAME: &str = "artsync-sync";

/// Store handles for one process, shared by every component that needs them.
#[derive(Clone)]
pub struct Stores {
    pub source: Arc<dyn SourceStore>,
    pub destination: Arc<dyn DestinationStore>,
}

impl Stores {
    /// Opens both pools. The destination schema is expected to be migrated already.
    pub async fn connect(config: &MigrationConfig) -> Result<Self> {
        let source = MySqlSource::connect(&config.source_database_url, config.max_connections)
            .await
            .context("connecting to source store")?;
        let destination = PgDestination::connect(&config.database_url, config.max_connections)
            .await
            .context("connecting to destination store")?;
        info!(max_connections = config.max_connections, "stores connected");
        Ok(Self {
            source: Arc::new(source),
            destination: Arc::new(destination),
        })
    }

    pub fn orchestrator(&self, config: MigrationConfig) -> Orchestrator {
        Orchestrator::new(self.source.clone(), self.destination.clone(), config)
    }

    pub fn pipeline(&self) -> ArticlePipeline {
        ArticlePipeline::new(self.source.clone(), self.destination.clone())
    }

    pub fn event_handler(&self) -> EventHandler {
        EventHandler::new(self.source.clone(), self.destination.clone())
    }

    pub fn reference_sync(&self) -> ReferenceSync {
        ReferenceSync::new(self.source.clone(), self.destination.clone())
    }
}

pub async fn run_migration_from_env(params: &RunParams, cancel: CancellationToken) -> Result<MigrationSummary> {
    let config = MigrationConfig::load()?;
    let stores = Stores::connect(&config).await?;
    let summary = stores.orchestrator(config).run(params, cancel).await?;
    Ok(summary)
}
