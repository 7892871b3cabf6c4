//! Legacy MySQL source. Table and column names follow the legacy schema; ids are cast in SQL so
//! every row decodes to the same Rust types regardless of the legacy column definitions.

use artsync_core::{
    Attachment, CategoryNode, ColumnRow, ExtensionFields, MirrorKind, PartitionFilter, Record,
    RecordReference, SiteInfo, SiteRow, EXTENSION_FIELD_NAMES,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, QueryBuilder, Row};
use tracing::debug;

use crate::{CategoryGraph, SiteDirectory, SourceStore, StoreResult};

const ARTICLE_SELECT: &str = "SELECT CAST(a.id AS CHAR) AS article_id, \
     CAST(a.createSiteId AS CHAR) AS site_id, s.name AS site_name, \
     CAST(a.folderId AS CHAR) AS folder_id, a.title, a.shortTitle AS short_title, \
     a.auxiliaryTitle AS auxiliary_title, a.creatorName AS creator_name, a.summary, \
     sa.publishTime AS publish_time, a.lastModifyTime AS last_modify_time, \
     sa.publisherName AS publisher_name, sa.publishOrgName AS publish_org_name, \
     a.firstImgPath AS first_img_path, a.imageDir AS image_dir, a.filepath AS file_path, \
     CAST(a.createTime AS CHAR) AS create_time, CAST(sa.visitCount AS SIGNED) AS visit_count";

const COLUMN_NODE_SELECT: &str =
    "CAST(c.id AS SIGNED) AS id, c.name AS name, CAST(c.siteId AS CHAR) AS site_id";

#[derive(Debug, Clone)]
pub struct MySqlSource {
    pool: MySqlPool,
}

impl MySqlSource {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

fn text(row: &MySqlRow, column: &str) -> Result<String, sqlx::Error> {
    Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
}

fn category_node(row: &MySqlRow) -> Result<CategoryNode, sqlx::Error> {
    Ok(CategoryNode {
        id: row.try_get("id")?,
        name: text(row, "name")?,
        site_id: row
            .try_get::<Option<String>, _>("site_id")?
            .filter(|s| !s.is_empty()),
    })
}

fn article_from_row(row: &MySqlRow) -> Result<Record, sqlx::Error> {
    let mut extension = ExtensionFields::default();
    for name in EXTENSION_FIELD_NAMES {
        extension.set(name, text(row, name)?);
    }

    Ok(Record {
        id: text(row, "article_id")?,
        site_id: text(row, "site_id")?,
        site_name: text(row, "site_name")?,
        folder_id: text(row, "folder_id")?,
        title: text(row, "title")?,
        short_title: text(row, "short_title")?,
        auxiliary_title: text(row, "auxiliary_title")?,
        creator_name: text(row, "creator_name")?,
        summary: text(row, "summary")?,
        publish_time: row.try_get::<Option<NaiveDateTime>, _>("publish_time")?,
        last_modify_time: row.try_get::<Option<NaiveDateTime>, _>("last_modify_time")?,
        publisher_name: text(row, "publisher_name")?,
        publish_org_name: text(row, "publish_org_name")?,
        first_img_path: text(row, "first_img_path")?,
        image_dir: text(row, "image_dir")?,
        file_path: text(row, "file_path")?,
        create_time: text(row, "create_time")?,
        visit_count: row.try_get::<Option<i64>, _>("visit_count")?.unwrap_or(0),
        extension,
        ..Default::default()
    })
}

#[async_trait]
impl CategoryGraph for MySqlSource {
    async fn unique_folder_column(&self, folder_id: i64) -> StoreResult<Option<CategoryNode>> {
        let sql = format!("SELECT {COLUMN_NODE_SELECT} FROM T_COLUMN c WHERE c.singleFolderId = ? LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(category_node).transpose()?)
    }

    async fn mirrors_of(&self, object_id: i64, kind: MirrorKind) -> StoreResult<Vec<CategoryNode>> {
        let sql = format!(
            "SELECT {COLUMN_NODE_SELECT} FROM T_COLUMN_DATASOURCE cds \
             JOIN T_COLUMN c ON cds.SrcColumnId = c.id \
             WHERE cds.mappingObjectId = ? AND cds.mappingTypeId = ?"
        );
        let rows = sqlx::query(&sql)
            .bind(object_id)
            .bind(kind.code())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(category_node).collect::<Result<_, _>>()?)
    }

    async fn article_columns(&self, article_id: i64) -> StoreResult<Vec<CategoryNode>> {
        let sql = format!(
            "SELECT {COLUMN_NODE_SELECT} FROM T_COLUMN c \
             JOIN T_COLUMNARTICLE ca ON c.id = ca.columnId WHERE ca.articleId = ?"
        );
        let rows = sqlx::query(&sql)
            .bind(article_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(category_node).collect::<Result<_, _>>()?)
    }
}

#[async_trait]
impl SiteDirectory for MySqlSource {
    async fn site(&self, site_id: &str) -> StoreResult<Option<SiteInfo>> {
        let row = sqlx::query(
            "SELECT s.DOMAINNAME AS domain_name, s.DUMMYNAME AS dummy_name, \
             CAST(ps.PARENTID AS CHAR) AS parent_id \
             FROM T_SITE s JOIN T_PUBLISHSITE ps ON s.ID = ps.SITEID WHERE s.ID = ? LIMIT 1",
        )
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(SiteInfo {
            domain_name: text(&row, "domain_name")?,
            dummy_name: text(&row, "dummy_name")?,
            parent_id: text(&row, "parent_id")?,
        }))
    }

    async fn parent_domain(&self, publish_site_id: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            "SELECT s.DOMAINNAME AS domain_name FROM T_PUBLISHSITE ps \
             JOIN T_SITE s ON s.ID = ps.SITEID WHERE ps.id = ? LIMIT 1",
        )
        .bind(publish_site_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| text(&r, "domain_name")).transpose()?)
    }

    async fn column_site(&self, column_id: i64) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT CAST(siteId AS CHAR) AS site_id FROM T_COLUMN WHERE id = ?")
            .bind(column_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| text(&r, "site_id")).transpose()?)
    }

    async fn column_name(&self, column_id: i64) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT name FROM T_COLUMN WHERE id = ?")
            .bind(column_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| text(&r, "name")).transpose()?)
    }

    async fn site_name(&self, site_id: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT name FROM T_SITE WHERE id = ?")
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| text(&r, "name")).transpose()?)
    }
}

#[async_trait]
impl SourceStore for MySqlSource {
    async fn list_references(
        &self,
        filter: &PartitionFilter,
        page_size: usize,
    ) -> StoreResult<Vec<RecordReference>> {
        let page_size = page_size.max(1);
        let mut refs = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut qb = QueryBuilder::<MySql>::new(
                "SELECT CAST(ta.id AS CHAR) AS id, CAST(tsa.siteId AS CHAR) AS site_id, \
                 CAST(tc.id AS CHAR) AS column_id FROM T_ARTICLE ta \
                 JOIN T_SITEARTICLE tsa ON ta.id = tsa.publishArticleId \
                 JOIN T_COLUMN tc ON tc.SyncFolderId = ta.folderId \
                 WHERE tsa.selfCreate = 1",
            );
            if let Some(site_id) = &filter.site_id {
                qb.push(" AND tsa.siteId = ").push_bind(site_id.as_str());
            }
            if let Some(column_id) = &filter.column_id {
                qb.push(" AND tc.id = ").push_bind(column_id.as_str());
            }
            qb.push(" ORDER BY ta.id, tc.id LIMIT ")
                .push_bind(page_size as u64)
                .push(" OFFSET ")
                .push_bind(offset as u64);

            let rows = qb.build().fetch_all(&self.pool).await?;
            let fetched = rows.len();
            for row in &rows {
                refs.push(RecordReference {
                    id: text(row, "id")?,
                    site_id: row.try_get("site_id")?,
                    column_id: row.try_get("column_id")?,
                });
            }
            debug!(offset, fetched, "read reference page");

            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        Ok(refs)
    }

    async fn fetch_record(&self, article_id: &str) -> StoreResult<Option<Record>> {
        let mut qb = QueryBuilder::<MySql>::new(ARTICLE_SELECT);
        for name in EXTENSION_FIELD_NAMES {
            qb.push(format!(", a.{name} AS {name}"));
        }
        qb.push(
            " FROM T_ARTICLE a \
             JOIN T_FOLDER f ON f.id = a.folderId \
             JOIN T_SITEARTICLE sa ON a.id = sa.publishArticleId \
             JOIN T_SITE s ON sa.siteId = s.id \
             WHERE sa.selfCreate = 1 AND a.deleted = 0 AND a.archived = 0 AND a.id = ",
        );
        qb.push_bind(article_id).push(" LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(article_from_row).transpose()?)
    }

    async fn fetch_content(&self, article_id: &str) -> StoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT content FROM T_ARTICLECONTENT WHERE articleId = ?")
            .bind(article_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| text(r, "content"))
            .collect::<Result<_, _>>()?)
    }

    async fn fetch_attachments(&self, article_id: &str) -> StoreResult<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT tm.name AS name, tm.filePath AS path FROM T_MEDIAFILE_USED tmu \
             JOIN T_MEDIAFILE tm ON tmu.mediaFileId = tm.id WHERE tmu.objId = ?",
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                Ok(Attachment {
                    name: text(r, "name")?,
                    path: text(r, "path")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()?)
    }

    async fn visit_counts(&self, article_ids: &[i64]) -> StoreResult<Vec<(i64, i64)>> {
        if article_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT CAST(sa.publishArticleId AS SIGNED) AS id, \
             CAST(sa.visitCount AS SIGNED) AS visit_count FROM T_SITEARTICLE sa \
             WHERE sa.selfCreate = 1 AND sa.publishArticleId IN (",
        );
        let mut ids = qb.separated(", ");
        for id in article_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| {
                Ok((
                    r.try_get::<i64, _>("id")?,
                    r.try_get::<Option<i64>, _>("visit_count")?.unwrap_or(0),
                ))
            })
            .collect::<Result<_, sqlx::Error>>()?)
    }

    async fn list_columns(&self) -> StoreResult<Vec<ColumnRow>> {
        let rows = sqlx::query(
            "SELECT CAST(id AS SIGNED) AS id, name, CAST(siteId AS SIGNED) AS site_id, \
             CAST(parentId AS SIGNED) AS parent_id, link, path, CAST(sort AS SIGNED) AS sort, \
             CAST(navigation AS SIGNED) AS navigation, CAST(readonly AS SIGNED) AS readonly \
             FROM T_COLUMN ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let int = |r: &MySqlRow, c: &str| -> Result<i64, sqlx::Error> {
            Ok(r.try_get::<Option<i64>, _>(c)?.unwrap_or(0))
        };
        Ok(rows
            .iter()
            .map(|r| {
                Ok(ColumnRow {
                    id: r.try_get("id")?,
                    name: text(r, "name")?,
                    site_id: int(r, "site_id")?,
                    parent_id: int(r, "parent_id")?,
                    link: text(r, "link")?,
                    path: text(r, "path")?,
                    sort: int(r, "sort")?,
                    navigation: int(r, "navigation")?,
                    readonly: int(r, "readonly")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()?)
    }

    async fn list_sites(&self) -> StoreResult<Vec<SiteRow>> {
        let rows = sqlx::query(
            "SELECT CAST(ID AS SIGNED) AS id, NAME AS name, DOMAINNAME AS domain_name, \
             filepath AS file_path, logo, ShortName AS short_name FROM T_SITE ORDER BY ID",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                Ok(SiteRow {
                    id: r.try_get("id")?,
                    name: text(r, "name")?,
                    domain_name: text(r, "domain_name")?,
                    file_path: text(r, "file_path")?,
                    logo: text(r, "logo")?,
                    short_name: text(r, "short_name")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()?)
    }
}
