//! Postgres destination. Article writes are delete-then-insert inside one transaction.

use std::collections::HashMap;
use std::time::Duration;

use artsync_core::{
    path_ids, ArticleFilter, ArticleSummary, ArticleWrite, Attachment, ColumnFilter,
    ColumnListing, ColumnRow, ExposureRow, Page, PageRequest, SiteRow, TableDiff,
    EXTENSION_FIELD_NAMES,
};
use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{DestinationStore, StoreResult};

pub static MIGRATOR: Migrator = sqlx::migrate!();

const ARTICLE_TABLES: [&str; 3] = ["article_static", "article_dynamic", "article_attachment"];

const STATIC_COLUMNS: [&str; 20] = [
    "article_id",
    "create_site_id",
    "site_name",
    "folder_id",
    "title",
    "short_title",
    "auxiliary_title",
    "creator_name",
    "summary",
    "publish_time",
    "last_modify_time",
    "publisher_name",
    "publish_org_name",
    "first_img_path",
    "image_dir",
    "file_path",
    "create_time",
    "visit_count",
    "content",
    "visit_url",
];

const SUMMARY_COLUMNS: &str = "article_id, title, summary, creator_name, publish_time, \
     last_modify_time, first_img_path, content, visit_url, visit_count";

#[derive(Debug, Clone)]
pub struct PgDestination {
    pool: PgPool,
}

impl PgDestination {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("destination migrations applied");
        Ok(())
    }
}

async fn delete_article_rows(conn: &mut PgConnection, article_id: i64) -> Result<(), sqlx::Error> {
    for table in ARTICLE_TABLES {
        sqlx::query(&format!("DELETE FROM {table} WHERE article_id = $1"))
            .bind(article_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn insert_static(conn: &mut PgConnection, write: &ArticleWrite<'_>) -> Result<(), sqlx::Error> {
    let r = write.record;
    let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO article_static (");
    let mut columns = qb.separated(", ");
    for column in STATIC_COLUMNS.iter().chain(EXTENSION_FIELD_NAMES.iter()) {
        columns.push(*column);
    }
    columns.push_unseparated(") VALUES (");

    let mut values = qb.separated(", ");
    values
        .push_bind(write.article_id)
        .push_bind(r.site_id.as_str())
        .push_bind(r.site_name.as_str())
        .push_bind(r.folder_id.as_str())
        .push_bind(r.title.as_str())
        .push_bind(r.short_title.as_str())
        .push_bind(r.auxiliary_title.as_str())
        .push_bind(r.creator_name.as_str())
        .push_bind(r.summary.as_str())
        .push_bind(r.publish_time)
        .push_bind(r.last_modify_time)
        .push_bind(r.publisher_name.as_str())
        .push_bind(r.publish_org_name.as_str())
        .push_bind(r.first_img_path.as_str())
        .push_bind(r.image_dir.as_str())
        .push_bind(r.file_path.as_str())
        .push_bind(r.create_time.as_str())
        .push_bind(r.visit_count)
        .push_bind(r.content.as_str())
        .push_bind(r.access_url.as_deref());
    for (_, value) in r.extension.iter() {
        values.push_bind(value);
    }
    values.push_unseparated(")");

    qb.build().execute(&mut *conn).await?;
    Ok(())
}

async fn insert_exposures(conn: &mut PgConnection, rows: &[ExposureRow]) -> Result<(), sqlx::Error> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO article_dynamic (article_id, column_id, column_name, site_id, site_name, url) ",
    );
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.article_id)
            .push_bind(row.column_id)
            .push_bind(row.column_name.as_str())
            .push_bind(row.site_id.as_str())
            .push_bind(row.site_name.as_str())
            .push_bind(row.url.as_deref());
    });
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

async fn insert_attachments(conn: &mut PgConnection, write: &ArticleWrite<'_>) -> Result<(), sqlx::Error> {
    let attachments = &write.record.attachments;
    if attachments.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO article_attachment (article_id, name, path) ");
    qb.push_values(attachments, |mut b, a| {
        b.push_bind(write.article_id)
            .push_bind(a.name.as_str())
            .push_bind(a.path.as_str());
    });
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

async fn apply_column_rows(conn: &mut PgConnection, diff: &TableDiff<ColumnRow>) -> Result<(), sqlx::Error> {
    if !diff.added.is_empty() {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO t_column (id, name, site_id, parent_id, link, path, sort, navigation, readonly) ",
        );
        qb.push_values(&diff.added, |mut b, c| {
            b.push_bind(c.id)
                .push_bind(c.name.as_str())
                .push_bind(c.site_id)
                .push_bind(c.parent_id)
                .push_bind(c.link.as_str())
                .push_bind(c.path.as_str())
                .push_bind(c.sort)
                .push_bind(c.navigation)
                .push_bind(c.readonly);
        });
        qb.build().execute(&mut *conn).await?;
    }
    for c in &diff.updated {
        sqlx::query(
            "UPDATE t_column SET name = $2, site_id = $3, parent_id = $4, link = $5, path = $6, \
             sort = $7, navigation = $8, readonly = $9 WHERE id = $1",
        )
        .bind(c.id)
        .bind(c.name.as_str())
        .bind(c.site_id)
        .bind(c.parent_id)
        .bind(c.link.as_str())
        .bind(c.path.as_str())
        .bind(c.sort)
        .bind(c.navigation)
        .bind(c.readonly)
        .execute(&mut *conn)
        .await?;
    }
    if !diff.deleted.is_empty() {
        sqlx::query("DELETE FROM t_column WHERE id = ANY($1)")
            .bind(diff.deleted.clone())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn apply_site_rows(conn: &mut PgConnection, diff: &TableDiff<SiteRow>) -> Result<(), sqlx::Error> {
    if !diff.added.is_empty() {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO t_site (id, name, domain_name, file_path, logo, short_name) ",
        );
        qb.push_values(&diff.added, |mut b, s| {
            b.push_bind(s.id)
                .push_bind(s.name.as_str())
                .push_bind(s.domain_name.as_str())
                .push_bind(s.file_path.as_str())
                .push_bind(s.logo.as_str())
                .push_bind(s.short_name.as_str());
        });
        qb.build().execute(&mut *conn).await?;
    }
    for s in &diff.updated {
        sqlx::query(
            "UPDATE t_site SET name = $2, domain_name = $3, file_path = $4, logo = $5, \
             short_name = $6 WHERE id = $1",
        )
        .bind(s.id)
        .bind(s.name.as_str())
        .bind(s.domain_name.as_str())
        .bind(s.file_path.as_str())
        .bind(s.logo.as_str())
        .bind(s.short_name.as_str())
        .execute(&mut *conn)
        .await?;
    }
    if !diff.deleted.is_empty() {
        sqlx::query("DELETE FROM t_site WHERE id = ANY($1)")
            .bind(diff.deleted.clone())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn push_article_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ArticleFilter) {
    qb.push(" WHERE TRUE");
    if let Some(columns) = &filter.columns {
        qb.push(" AND article_id IN (SELECT article_id FROM article_dynamic WHERE column_id = ANY(")
            .push_bind(columns.clone())
            .push("))");
    } else if let Some(sites) = &filter.sites {
        qb.push(" AND article_id IN (SELECT article_id FROM article_dynamic WHERE site_id = ANY(")
            .push_bind(sites.clone())
            .push("))");
    }
    if let Some(article_id) = filter.article_id {
        qb.push(" AND article_id = ").push_bind(article_id);
    }
    if let Some(title) = &filter.title {
        qb.push(" AND title LIKE ").push_bind(format!("%{title}%"));
    }
    if let Some(from) = filter.published_from {
        qb.push(" AND publish_time >= ").push_bind(from);
    }
    if let Some(to) = filter.published_to {
        qb.push(" AND publish_time <= ").push_bind(to);
    }
}

fn push_column_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ColumnFilter) {
    qb.push(" WHERE TRUE");
    if !filter.sites.is_empty() {
        qb.push(" AND site_id = ANY(").push_bind(filter.sites.clone()).push(")");
    }
    if let Some(parent_id) = filter.parent_id {
        qb.push(" AND parent_id = ").push_bind(parent_id);
    }
    if let Some(name) = &filter.name {
        qb.push(" AND name LIKE ").push_bind(format!("%{name}%"));
    }
    if filter.roots_only {
        qb.push(" AND parent_id IN (0, 1) AND id <> 1");
    }
}

fn summary_from_row(row: &PgRow) -> Result<ArticleSummary, sqlx::Error> {
    Ok(ArticleSummary {
        article_id: row.try_get("article_id")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        creator_name: row.try_get("creator_name")?,
        publish_time: row.try_get("publish_time")?,
        last_modify_time: row.try_get("last_modify_time")?,
        first_img_path: row.try_get("first_img_path")?,
        content: row.try_get("content")?,
        visit_url: row.try_get("visit_url")?,
        visit_count: row.try_get("visit_count")?,
        columns: Vec::new(),
        attachments: Vec::new(),
    })
}

fn exposure_from_row(row: &PgRow) -> Result<ExposureRow, sqlx::Error> {
    Ok(ExposureRow {
        article_id: row.try_get("article_id")?,
        column_id: row.try_get("column_id")?,
        column_name: row.try_get("column_name")?,
        site_id: row.try_get("site_id")?,
        site_name: row.try_get("site_name")?,
        url: row.try_get("url")?,
    })
}

fn column_from_row(row: &PgRow) -> Result<ColumnRow, sqlx::Error> {
    Ok(ColumnRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        site_id: row.try_get("site_id")?,
        parent_id: row.try_get("parent_id")?,
        link: row.try_get("link")?,
        path: row.try_get("path")?,
        sort: row.try_get("sort")?,
        navigation: row.try_get("navigation")?,
        readonly: row.try_get("readonly")?,
    })
}

fn site_from_row(row: &PgRow) -> Result<SiteRow, sqlx::Error> {
    Ok(SiteRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        domain_name: row.try_get("domain_name")?,
        file_path: row.try_get("file_path")?,
        logo: row.try_get("logo")?,
        short_name: row.try_get("short_name")?,
    })
}

#[async_trait]
impl DestinationStore for PgDestination {
    async fn contains(&self, article_id: i64) -> StoreResult<bool> {
        let found = sqlx::query("SELECT 1 FROM article_static WHERE article_id = $1 LIMIT 1")
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn replace_article(&self, write: &ArticleWrite<'_>) -> StoreResult<()> {
        // Dropping the transaction on any early return rolls it back.
        let mut tx = self.pool.begin().await?;
        delete_article_rows(&mut *tx, write.article_id).await?;
        insert_static(&mut *tx, write).await?;
        insert_exposures(&mut *tx, &write.exposures).await?;
        insert_attachments(&mut *tx, write).await?;
        tx.commit().await?;

        debug!(
            article_id = write.article_id,
            exposures = write.exposures.len(),
            attachments = write.record.attachments.len(),
            "article replaced"
        );
        Ok(())
    }

    async fn delete_article(&self, article_id: i64) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        delete_article_rows(&mut *tx, article_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn has_association(&self, article_id: i64, column_id: i64) -> StoreResult<bool> {
        let found = sqlx::query(
            "SELECT 1 FROM article_dynamic WHERE article_id = $1 AND column_id = $2 LIMIT 1",
        )
        .bind(article_id)
        .bind(column_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn insert_association(&self, row: &ExposureRow) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_exposures(&mut *conn, std::slice::from_ref(row)).await?;
        Ok(())
    }

    async fn remove_association(&self, article_id: i64, column_id: i64) -> StoreResult<u64> {
        let done = sqlx::query("DELETE FROM article_dynamic WHERE article_id = $1 AND column_id = $2")
            .bind(article_id)
            .bind(column_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn existing_ids(&self, article_ids: &[i64]) -> StoreResult<Vec<i64>> {
        if article_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT article_id FROM article_static WHERE article_id = ANY($1)")
            .bind(article_ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<i64, _>("article_id"))
            .collect::<Result<_, _>>()?)
    }

    async fn update_visit_count(&self, article_id: i64, visit_count: i64) -> StoreResult<()> {
        sqlx::query("UPDATE article_static SET visit_count = $1 WHERE article_id = $2")
            .bind(visit_count)
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_columns(&self) -> StoreResult<Vec<ColumnRow>> {
        let rows = sqlx::query(
            "SELECT id, name, site_id, parent_id, link, path, sort, navigation, readonly \
             FROM t_column ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(column_from_row).collect::<Result<_, _>>()?)
    }

    async fn load_sites(&self) -> StoreResult<Vec<SiteRow>> {
        let rows = sqlx::query(
            "SELECT id, name, domain_name, file_path, logo, short_name FROM t_site ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(site_from_row).collect::<Result<_, _>>()?)
    }

    async fn query_articles(
        &self,
        filter: &ArticleFilter,
        page: PageRequest,
    ) -> StoreResult<Page<ArticleSummary>> {
        if filter.is_unsatisfiable() {
            return Ok(page.paginate(Vec::new(), 0));
        }

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM article_static");
        push_article_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {SUMMARY_COLUMNS} FROM article_static"));
        push_article_filter(&mut qb, filter);
        qb.push(" ORDER BY publish_time DESC NULLS LAST, article_id DESC LIMIT ")
            .push_bind(page.page_size as i64)
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut items: Vec<ArticleSummary> = rows.iter().map(summary_from_row).collect::<Result<_, _>>()?;

        let ids: Vec<i64> = items.iter().map(|a| a.article_id).collect();
        if !ids.is_empty() {
            let mut exposures: HashMap<i64, Vec<ExposureRow>> = HashMap::new();
            let rows = sqlx::query(
                "SELECT article_id, column_id, column_name, site_id, site_name, url \
                 FROM article_dynamic WHERE article_id = ANY($1) ORDER BY article_id, column_id",
            )
            .bind(ids.clone())
            .fetch_all(&self.pool)
            .await?;
            for row in &rows {
                let exposure = exposure_from_row(row)?;
                exposures.entry(exposure.article_id).or_default().push(exposure);
            }

            let mut attachments: HashMap<i64, Vec<Attachment>> = HashMap::new();
            let rows = sqlx::query(
                "SELECT article_id, name, path FROM article_attachment \
                 WHERE article_id = ANY($1) ORDER BY article_id, id",
            )
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
            for row in &rows {
                attachments
                    .entry(row.try_get("article_id")?)
                    .or_default()
                    .push(Attachment {
                        name: row.try_get("name")?,
                        path: row.try_get("path")?,
                    });
            }

            for item in &mut items {
                item.columns = exposures.remove(&item.article_id).unwrap_or_default();
                item.attachments = attachments.remove(&item.article_id).unwrap_or_default();
                item.finish(filter.url_column());
            }
        }

        debug!(total, returned = items.len(), page = page.page, "article page queried");
        Ok(page.paginate(items, total.max(0) as u64))
    }

    async fn list_columns(
        &self,
        filter: &ColumnFilter,
        page: PageRequest,
    ) -> StoreResult<Page<ColumnListing>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM t_column");
        push_column_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, name, site_id, parent_id, link, path, sort, navigation, readonly FROM t_column",
        );
        push_column_filter(&mut qb, filter);
        qb.push(" ORDER BY id LIMIT ")
            .push_bind(page.page_size as i64)
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let columns: Vec<ColumnRow> = rows.iter().map(column_from_row).collect::<Result<_, _>>()?;

        let mut ancestor_ids: Vec<i64> = columns.iter().flat_map(|c| path_ids(&c.path)).collect();
        ancestor_ids.sort_unstable();
        ancestor_ids.dedup();
        let mut names = HashMap::new();
        if !ancestor_ids.is_empty() {
            let rows = sqlx::query("SELECT id, name FROM t_column WHERE id = ANY($1)")
                .bind(ancestor_ids)
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                names.insert(row.try_get::<i64, _>("id")?, row.try_get::<String, _>("name")?);
            }
        }

        let items = columns.iter().map(|c| ColumnListing::new(c, &names)).collect();
        Ok(page.paginate(items, total.max(0) as u64))
    }

    async fn apply_reference_diff(
        &self,
        columns: &TableDiff<ColumnRow>,
        sites: &TableDiff<SiteRow>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        apply_column_rows(&mut *tx, columns).await?;
        apply_site_rows(&mut *tx, sites).await?;
        tx.commit().await?;
        Ok(())
    }
}
