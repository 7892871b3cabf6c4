//! Store seams for the legacy source and the normalized destination, plus their implementations.

use artsync_core::{
    ArticleFilter, ArticleSummary, ArticleWrite, Attachment, CategoryNode, ColumnFilter,
    ColumnListing, ColumnRow, ExposureRow, MirrorKind, Page, PageRequest, PartitionFilter, Record,
    RecordReference, SiteInfo, SiteRow, TableDiff,
};
use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod mysql;
mod postgres;

pub use memory::{DestinationSnapshot, MemoryDestination, MemorySource};
pub use mysql::MySqlSource;
pub use postgres::{PgDestination, MIGRATOR};

pub const CRATE_NAME: &str = "artsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid id {0:?}")]
    InvalidId(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Parses a legacy string id into the integer key used by the category graph and the destination.
pub fn parse_id(raw: &str) -> StoreResult<i64> {
    raw.trim()
        .parse()
        .map_err(|_| StoreError::InvalidId(raw.to_string()))
}

/// Edges of the category graph: folder -> column mappings, mirror sources and direct links.
#[async_trait]
pub trait CategoryGraph: Send + Sync {
    /// The column whose unique source folder is `folder_id` (at most one).
    async fn unique_folder_column(&self, folder_id: i64) -> StoreResult<Option<CategoryNode>>;

    /// Columns that mirror `object_id`: a folder for [`MirrorKind::Folder`], a column for
    /// [`MirrorKind::Column`].
    async fn mirrors_of(&self, object_id: i64, kind: MirrorKind) -> StoreResult<Vec<CategoryNode>>;

    /// Columns the article was published into directly.
    async fn article_columns(&self, article_id: i64) -> StoreResult<Vec<CategoryNode>>;
}

/// Site and column lookups needed to derive URLs and association rows.
#[async_trait]
pub trait SiteDirectory: Send + Sync {
    async fn site(&self, site_id: &str) -> StoreResult<Option<SiteInfo>>;

    /// Domain list of the site owning publish-site `publish_site_id`.
    async fn parent_domain(&self, publish_site_id: &str) -> StoreResult<Option<String>>;

    async fn column_site(&self, column_id: i64) -> StoreResult<Option<String>>;

    async fn column_name(&self, column_id: i64) -> StoreResult<Option<String>>;

    async fn site_name(&self, site_id: &str) -> StoreResult<Option<String>>;
}

/// Read-only view of the legacy store.
#[async_trait]
pub trait SourceStore: CategoryGraph + SiteDirectory {
    /// Every reference matching `filter`, read in pages of `page_size`, ordered by article then
    /// column id.
    async fn list_references(
        &self,
        filter: &PartitionFilter,
        page_size: usize,
    ) -> StoreResult<Vec<RecordReference>>;

    /// Article metadata restricted to self-created, live rows. Content, attachments and the
    /// exposure set are left empty.
    async fn fetch_record(&self, article_id: &str) -> StoreResult<Option<Record>>;

    async fn fetch_content(&self, article_id: &str) -> StoreResult<Vec<String>>;

    async fn fetch_attachments(&self, article_id: &str) -> StoreResult<Vec<Attachment>>;

    /// `(article_id, visit_count)` for self-created rows among `article_ids`.
    async fn visit_counts(&self, article_ids: &[i64]) -> StoreResult<Vec<(i64, i64)>>;

    async fn list_columns(&self) -> StoreResult<Vec<ColumnRow>>;

    async fn list_sites(&self) -> StoreResult<Vec<SiteRow>>;
}

/// Transactional view of the destination store.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn contains(&self, article_id: i64) -> StoreResult<bool>;

    /// Deletes every row of the article across the three article tables and inserts the new
    /// ones, all in one transaction.
    async fn replace_article(&self, write: &ArticleWrite<'_>) -> StoreResult<()>;

    async fn delete_article(&self, article_id: i64) -> StoreResult<()>;

    async fn has_association(&self, article_id: i64, column_id: i64) -> StoreResult<bool>;

    async fn insert_association(&self, row: &ExposureRow) -> StoreResult<()>;

    /// Returns the number of association rows removed.
    async fn remove_association(&self, article_id: i64, column_id: i64) -> StoreResult<u64>;

    /// The subset of `article_ids` already present.
    async fn existing_ids(&self, article_ids: &[i64]) -> StoreResult<Vec<i64>>;

    async fn update_visit_count(&self, article_id: i64, visit_count: i64) -> StoreResult<()>;

    async fn load_columns(&self) -> StoreResult<Vec<ColumnRow>>;

    async fn load_sites(&self) -> StoreResult<Vec<SiteRow>>;

    /// Articles matching `filter`, newest first, one page at a time. Each item carries its
    /// associations and attachments.
    async fn query_articles(
        &self,
        filter: &ArticleFilter,
        page: PageRequest,
    ) -> StoreResult<Page<ArticleSummary>>;

    /// Columns matching `filter` ascending by id, with their paths rendered as names.
    async fn list_columns(
        &self,
        filter: &ColumnFilter,
        page: PageRequest,
    ) -> StoreResult<Page<ColumnListing>>;

    /// Applies both table diffs in one transaction: either every change lands or none does.
    async fn apply_reference_diff(
        &self,
        columns: &TableDiff<ColumnRow>,
        sites: &TableDiff<SiteRow>,
    ) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_trims_and_rejects_garbage() {
        assert_eq!(parse_id(" 42").unwrap(), 42);
        assert!(matches!(parse_id("4x2"), Err(StoreError::InvalidId(raw)) if raw == "4x2"));
        assert!(parse_id("").is_err());
    }
}
