use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use artsync_core::{
    parse_id_list, ArticleFilter, ColumnFilter, PageRequest, PartitionFilter, RecordReference,
};
use artsync_storage::{DestinationStore, PgDestination};
use artsync_sync::{ApplyOutcome, ConcurrencyStrategy, MigrationConfig, RunParams, Stores};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "artsync-cli")]
#[command(about = "Recover and reconcile site-group articles into the article store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    WorkerPool,
    Semaphore,
}

impl From<StrategyArg> for ConcurrencyStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::WorkerPool => ConcurrencyStrategy::WorkerPool,
            StrategyArg::Semaphore => ConcurrencyStrategy::Semaphore,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bulk-migrate every article matching the filters.
    Recover {
        #[arg(long)]
        site_id: Option<String>,
        #[arg(long)]
        column_id: Option<String>,
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
        /// 0 uses the host's core count.
        #[arg(long, default_value_t = 0)]
        concurrency: usize,
        /// 0 uses twice the concurrency.
        #[arg(long, default_value_t = 0)]
        worker_pool_size: usize,
        #[arg(long, value_enum, default_value_t = StrategyArg::WorkerPool)]
        strategy: StrategyArg,
    },
    /// Apply a single article outside any batch.
    Apply { article_id: String },
    /// Replay one message-bus payload from a JSON file.
    Event { file: PathBuf },
    /// Reconcile the column and site tables, once or on the configured schedule.
    SyncTables {
        #[arg(long)]
        schedule: bool,
    },
    /// Apply destination schema migrations.
    Migrate,
    /// Page through migrated articles, newest first.
    Articles {
        /// Comma-separated column ids; takes precedence over --site-id.
        #[arg(long)]
        column_id: Option<String>,
        /// Comma-separated site ids.
        #[arg(long)]
        site_id: Option<String>,
        #[arg(long)]
        article_id: Option<String>,
        /// Substring of the title.
        #[arg(long)]
        title: Option<String>,
        /// RFC 3339, `YYYY-MM-DD HH:MM:SS` or a bare date.
        #[arg(long)]
        start_time: Option<String>,
        #[arg(long)]
        end_time: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        /// 1..=100; anything else uses 20.
        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },
    /// Page through the column table with rendered paths.
    Columns {
        /// Comma-separated site ids.
        #[arg(long)]
        site_id: Option<String>,
        #[arg(long)]
        parent_id: Option<i64>,
        #[arg(long)]
        name: Option<String>,
        /// Only top-level columns.
        #[arg(long)]
        tree: bool,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },
}

async fn connect_destination(config: &MigrationConfig) -> Result<PgDestination> {
    PgDestination::connect(&config.database_url, config.max_connections)
        .await
        .context("connecting to destination store")
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = logging::init_logger();
    let cli = Cli::parse();
    let config = MigrationConfig::load()?;

    match cli.command {
        Commands::Recover {
            site_id,
            column_id,
            batch_size,
            concurrency,
            worker_pool_size,
            strategy,
        } => {
            let params = RunParams {
                filter: PartitionFilter { site_id, column_id },
                batch_size,
                concurrency,
                worker_pool_size,
                strategy: strategy.into(),
            };
            let stores = Stores::connect(&config).await?;
            let summary = stores.orchestrator(config).run(&params, cancel_on_ctrl_c()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Apply { article_id } => {
            let stores = Stores::connect(&config).await?;
            let outcome = stores
                .pipeline()
                .apply_reference(&RecordReference::new(article_id.trim()))
                .await;
            println!("article {}: {outcome}", article_id.trim());
            if let ApplyOutcome::Failed(_) = outcome {
                bail!("apply failed for article {}", article_id.trim());
            }
        }
        Commands::Event { file } => {
            let payload = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let stores = Stores::connect(&config).await?;
            let outcome = stores.event_handler().handle_payload(&payload).await?;
            println!("event handled: {outcome:?}");
        }
        Commands::SyncTables { schedule } => {
            let stores = Stores::connect(&config).await?;
            let sync = Arc::new(stores.reference_sync());
            if !schedule || config.sync_on_start {
                let report = sync.run_once().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            if schedule {
                sync.run_scheduled(&config.sync_cron, cancel_on_ctrl_c()).await?;
            }
        }
        Commands::Migrate => {
            let destination = connect_destination(&config).await?;
            destination.migrate().await.context("applying migrations")?;
            info!("destination schema up to date");
            println!("migrations applied");
        }
        Commands::Articles {
            column_id,
            site_id,
            article_id,
            title,
            start_time,
            end_time,
            page,
            page_size,
        } => {
            let filter = ArticleFilter::from_params(
                column_id.as_deref(),
                site_id.as_deref(),
                article_id.as_deref(),
                title.as_deref(),
                start_time.as_deref(),
                end_time.as_deref(),
            )?;
            let destination = connect_destination(&config).await?;
            let result = destination
                .query_articles(&filter, PageRequest::new(page, page_size))
                .await
                .context("querying articles")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Columns {
            site_id,
            parent_id,
            name,
            tree,
            page,
            page_size,
        } => {
            let filter = ColumnFilter {
                sites: site_id.as_deref().map(parse_id_list).unwrap_or_default(),
                parent_id,
                name: name.filter(|n| !n.trim().is_empty()),
                roots_only: tree,
            };
            let destination = connect_destination(&config).await?;
            let result = destination
                .list_columns(&filter, PageRequest::new(page, page_size))
                .await
                .context("listing columns")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
