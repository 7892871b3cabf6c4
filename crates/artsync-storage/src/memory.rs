//! In-memory stores for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use artsync_core::{
    sort_newest_first, ArticleFilter, ArticleSummary, ArticleWrite, Attachment, CategoryNode,
    ColumnFilter, ColumnListing, ColumnRow, ExposureRow, MirrorKind, Page, PageRequest,
    PartitionFilter, Record, RecordReference, SiteInfo, SiteRow, TableDiff,
};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    CategoryGraph, DestinationStore, SiteDirectory, SourceStore, StoreError, StoreResult,
};

/// Legacy store held in maps. Populate it through the `insert_*`/`add_*` methods, then share it
/// behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    references: Vec<RecordReference>,
    records: BTreeMap<String, Record>,
    contents: BTreeMap<String, Vec<String>>,
    attachments: BTreeMap<String, Vec<Attachment>>,
    visit_counts: BTreeMap<i64, i64>,
    unique_folder: BTreeMap<i64, CategoryNode>,
    folder_mirrors: BTreeMap<i64, Vec<CategoryNode>>,
    column_mirrors: BTreeMap<i64, Vec<CategoryNode>>,
    article_columns: BTreeMap<i64, Vec<CategoryNode>>,
    sites: BTreeMap<String, SiteInfo>,
    site_names: BTreeMap<String, String>,
    publish_site_domains: BTreeMap<String, String>,
    columns: BTreeMap<i64, ColumnRow>,
    site_rows: BTreeMap<i64, SiteRow>,
    failing_records: BTreeSet<String>,
    failing_content: BTreeSet<String>,
    failing_mirrors: BTreeSet<i64>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the record and a reference to it. Content and attachments are split off into their
    /// own tables as the legacy store keeps them.
    pub fn insert_record(&mut self, mut record: Record) {
        let content = std::mem::take(&mut record.content);
        let attachments = std::mem::take(&mut record.attachments);
        record.exposure.clear();
        if !content.is_empty() {
            self.contents.insert(record.id.clone(), vec![content]);
        }
        if !attachments.is_empty() {
            self.attachments.insert(record.id.clone(), attachments);
        }
        if let Some(id) = record.numeric_id() {
            self.visit_counts.insert(id, record.visit_count);
        }
        self.references.push(RecordReference {
            id: record.id.clone(),
            site_id: Some(record.site_id.clone()).filter(|s| !s.is_empty()),
            column_id: None,
        });
        self.records.insert(record.id.clone(), record);
    }

    pub fn add_reference(&mut self, reference: RecordReference) {
        self.references.push(reference);
    }

    pub fn set_content_chunks(&mut self, article_id: &str, chunks: Vec<String>) {
        self.contents.insert(article_id.to_string(), chunks);
    }

    pub fn set_visit_count(&mut self, article_id: i64, visit_count: i64) {
        self.visit_counts.insert(article_id, visit_count);
    }

    pub fn set_unique_folder_column(&mut self, folder_id: i64, column: CategoryNode) {
        self.unique_folder.insert(folder_id, column);
    }

    /// Records that `mirror` displays `object_id` (a folder or a column depending on `kind`).
    pub fn add_mirror(&mut self, object_id: i64, kind: MirrorKind, mirror: CategoryNode) {
        let edges = match kind {
            MirrorKind::Folder => &mut self.folder_mirrors,
            MirrorKind::Column => &mut self.column_mirrors,
        };
        edges.entry(object_id).or_default().push(mirror);
    }

    pub fn add_article_column(&mut self, article_id: i64, column: CategoryNode) {
        self.article_columns.entry(article_id).or_default().push(column);
    }

    pub fn add_site(&mut self, site_id: &str, name: &str, info: SiteInfo) {
        self.site_names.insert(site_id.to_string(), name.to_string());
        self.sites.insert(site_id.to_string(), info);
    }

    pub fn set_publish_site_domain(&mut self, publish_site_id: &str, domain: &str) {
        self.publish_site_domains
            .insert(publish_site_id.to_string(), domain.to_string());
    }

    pub fn add_column(&mut self, column: ColumnRow) {
        self.columns.insert(column.id, column);
    }

    pub fn add_site_row(&mut self, site: SiteRow) {
        self.site_rows.insert(site.id, site);
    }

    pub fn fail_record(&mut self, article_id: &str) {
        self.failing_records.insert(article_id.to_string());
    }

    pub fn fail_content(&mut self, article_id: &str) {
        self.failing_content.insert(article_id.to_string());
    }

    /// Makes mirror lookups for `object_id` error, for either kind.
    pub fn fail_mirrors_of(&mut self, object_id: i64) {
        self.failing_mirrors.insert(object_id);
    }
}

#[async_trait]
impl CategoryGraph for MemorySource {
    async fn unique_folder_column(&self, folder_id: i64) -> StoreResult<Option<CategoryNode>> {
        Ok(self.unique_folder.get(&folder_id).cloned())
    }

    async fn mirrors_of(&self, object_id: i64, kind: MirrorKind) -> StoreResult<Vec<CategoryNode>> {
        if self.failing_mirrors.contains(&object_id) {
            return Err(StoreError::Unavailable(format!(
                "mirror lookup for {object_id} (kind {})",
                kind.code()
            )));
        }
        let edges = match kind {
            MirrorKind::Folder => &self.folder_mirrors,
            MirrorKind::Column => &self.column_mirrors,
        };
        Ok(edges.get(&object_id).cloned().unwrap_or_default())
    }

    async fn article_columns(&self, article_id: i64) -> StoreResult<Vec<CategoryNode>> {
        Ok(self
            .article_columns
            .get(&article_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SiteDirectory for MemorySource {
    async fn site(&self, site_id: &str) -> StoreResult<Option<SiteInfo>> {
        Ok(self.sites.get(site_id).cloned())
    }

    async fn parent_domain(&self, publish_site_id: &str) -> StoreResult<Option<String>> {
        Ok(self.publish_site_domains.get(publish_site_id).cloned())
    }

    async fn column_site(&self, column_id: i64) -> StoreResult<Option<String>> {
        Ok(self.columns.get(&column_id).map(|c| c.site_id.to_string()))
    }

    async fn column_name(&self, column_id: i64) -> StoreResult<Option<String>> {
        Ok(self.columns.get(&column_id).map(|c| c.name.clone()))
    }

    async fn site_name(&self, site_id: &str) -> StoreResult<Option<String>> {
        Ok(self.site_names.get(site_id).cloned())
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn list_references(
        &self,
        filter: &PartitionFilter,
        _page_size: usize,
    ) -> StoreResult<Vec<RecordReference>> {
        let matches = |wanted: &Option<String>, actual: &Option<String>| match wanted {
            Some(w) => actual.as_deref() == Some(w.as_str()),
            None => true,
        };
        Ok(self
            .references
            .iter()
            .filter(|r| matches(&filter.site_id, &r.site_id) && matches(&filter.column_id, &r.column_id))
            .cloned()
            .collect())
    }

    async fn fetch_record(&self, article_id: &str) -> StoreResult<Option<Record>> {
        if self.failing_records.contains(article_id) {
            return Err(StoreError::Unavailable(format!("record {article_id}")));
        }
        Ok(self.records.get(article_id).cloned())
    }

    async fn fetch_content(&self, article_id: &str) -> StoreResult<Vec<String>> {
        if self.failing_content.contains(article_id) {
            return Err(StoreError::Unavailable(format!("content of {article_id}")));
        }
        Ok(self.contents.get(article_id).cloned().unwrap_or_default())
    }

    async fn fetch_attachments(&self, article_id: &str) -> StoreResult<Vec<Attachment>> {
        Ok(self.attachments.get(article_id).cloned().unwrap_or_default())
    }

    async fn visit_counts(&self, article_ids: &[i64]) -> StoreResult<Vec<(i64, i64)>> {
        Ok(article_ids
            .iter()
            .filter_map(|id| self.visit_counts.get(id).map(|count| (*id, *count)))
            .collect())
    }

    async fn list_columns(&self) -> StoreResult<Vec<ColumnRow>> {
        Ok(self.columns.values().cloned().collect())
    }

    async fn list_sites(&self) -> StoreResult<Vec<SiteRow>> {
        Ok(self.site_rows.values().cloned().collect())
    }
}

/// Full contents of a [`MemoryDestination`], comparable across calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestinationSnapshot {
    pub articles: BTreeMap<i64, Record>,
    pub associations: BTreeMap<i64, Vec<ExposureRow>>,
    pub attachments: BTreeMap<i64, Vec<Attachment>>,
    pub columns: BTreeMap<i64, ColumnRow>,
    pub sites: BTreeMap<i64, SiteRow>,
}

#[derive(Debug, Default)]
struct DestinationState {
    tables: DestinationSnapshot,
    failing_writes: BTreeSet<i64>,
    fail_reference_writes: bool,
    fail_site_writes: bool,
    writes: usize,
}

/// Destination held behind one lock, so each write is atomic with respect to readers.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    state: Mutex<DestinationState>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> DestinationSnapshot {
        self.state.lock().await.tables.clone()
    }

    /// Number of committed article writes (replace, delete, association and visit-count changes).
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    /// Makes every article write for `article_id` fail before touching the tables.
    pub async fn fail_writes_for(&self, article_id: i64) {
        self.state.lock().await.failing_writes.insert(article_id);
    }

    /// Fails reference diffs before either table is touched.
    pub async fn fail_reference_writes(&self) {
        self.state.lock().await.fail_reference_writes = true;
    }

    /// Fails reference diffs at the site table, after the column changes were staged.
    pub async fn fail_site_writes(&self) {
        self.state.lock().await.fail_site_writes = true;
    }
}

impl DestinationState {
    fn check_writable(&self, article_id: i64) -> StoreResult<()> {
        if self.failing_writes.contains(&article_id) {
            return Err(StoreError::Unavailable(format!("write for article {article_id}")));
        }
        Ok(())
    }

    fn check_reference_writable(&self) -> StoreResult<()> {
        if self.fail_reference_writes {
            return Err(StoreError::Unavailable("reference table write".into()));
        }
        Ok(())
    }
}

/// Column and site filters are matched against the article's association rows.
fn passes_association_filter(rows: Option<&Vec<ExposureRow>>, filter: &ArticleFilter) -> bool {
    let rows = rows.map(Vec::as_slice).unwrap_or_default();
    if let Some(columns) = &filter.columns {
        return rows.iter().any(|r| columns.contains(&r.column_id));
    }
    if let Some(sites) = &filter.sites {
        return rows.iter().any(|r| sites.contains(&r.site_id));
    }
    true
}

fn summary_of(article_id: i64, record: &Record, tables: &DestinationSnapshot) -> ArticleSummary {
    ArticleSummary {
        article_id,
        title: record.title.clone(),
        summary: record.summary.clone(),
        creator_name: record.creator_name.clone(),
        publish_time: record.publish_time,
        last_modify_time: record.last_modify_time,
        first_img_path: record.first_img_path.clone(),
        content: record.content.clone(),
        visit_url: record.access_url.clone(),
        visit_count: record.visit_count,
        columns: tables.associations.get(&article_id).cloned().unwrap_or_default(),
        attachments: tables.attachments.get(&article_id).cloned().unwrap_or_default(),
    }
}

fn apply_diff<T: Clone>(
    table: &mut BTreeMap<i64, T>,
    diff: &TableDiff<T>,
    id_of: impl Fn(&T) -> i64,
) {
    for row in diff.added.iter().chain(diff.updated.iter()) {
        table.insert(id_of(row), row.clone());
    }
    for id in &diff.deleted {
        table.remove(id);
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn contains(&self, article_id: i64) -> StoreResult<bool> {
        Ok(self.state.lock().await.tables.articles.contains_key(&article_id))
    }

    async fn replace_article(&self, write: &ArticleWrite<'_>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check_writable(write.article_id)?;

        let id = write.article_id;
        let tables = &mut state.tables;
        tables.articles.remove(&id);
        tables.associations.remove(&id);
        tables.attachments.remove(&id);

        tables.articles.insert(id, write.record.clone());
        if !write.exposures.is_empty() {
            tables.associations.insert(id, write.exposures.clone());
        }
        if !write.record.attachments.is_empty() {
            tables.attachments.insert(id, write.record.attachments.clone());
        }
        state.writes += 1;
        Ok(())
    }

    async fn delete_article(&self, article_id: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check_writable(article_id)?;
        state.tables.articles.remove(&article_id);
        state.tables.associations.remove(&article_id);
        state.tables.attachments.remove(&article_id);
        state.writes += 1;
        Ok(())
    }

    async fn has_association(&self, article_id: i64, column_id: i64) -> StoreResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .associations
            .get(&article_id)
            .is_some_and(|rows| rows.iter().any(|r| r.column_id == column_id)))
    }

    async fn insert_association(&self, row: &ExposureRow) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check_writable(row.article_id)?;
        state
            .tables
            .associations
            .entry(row.article_id)
            .or_default()
            .push(row.clone());
        state.writes += 1;
        Ok(())
    }

    async fn remove_association(&self, article_id: i64, column_id: i64) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        state.check_writable(article_id)?;
        let Some(rows) = state.tables.associations.get_mut(&article_id) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| r.column_id != column_id);
        let removed = (before - rows.len()) as u64;
        if rows.is_empty() {
            state.tables.associations.remove(&article_id);
        }
        if removed > 0 {
            state.writes += 1;
        }
        Ok(removed)
    }

    async fn existing_ids(&self, article_ids: &[i64]) -> StoreResult<Vec<i64>> {
        let state = self.state.lock().await;
        Ok(article_ids
            .iter()
            .copied()
            .filter(|id| state.tables.articles.contains_key(id))
            .collect())
    }

    async fn update_visit_count(&self, article_id: i64, visit_count: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check_writable(article_id)?;
        if let Some(record) = state.tables.articles.get_mut(&article_id) {
            record.visit_count = visit_count;
            state.writes += 1;
        }
        Ok(())
    }

    async fn load_columns(&self) -> StoreResult<Vec<ColumnRow>> {
        Ok(self.state.lock().await.tables.columns.values().cloned().collect())
    }

    async fn load_sites(&self) -> StoreResult<Vec<SiteRow>> {
        Ok(self.state.lock().await.tables.sites.values().cloned().collect())
    }

    async fn query_articles(
        &self,
        filter: &ArticleFilter,
        page: PageRequest,
    ) -> StoreResult<Page<ArticleSummary>> {
        if filter.is_unsatisfiable() {
            return Ok(page.paginate(Vec::new(), 0));
        }
        let state = self.state.lock().await;
        let tables = &state.tables;
        let mut matched: Vec<ArticleSummary> = tables
            .articles
            .iter()
            .filter(|(id, _)| passes_association_filter(tables.associations.get(*id), filter))
            .filter(|(id, r)| filter.matches_static(**id, &r.title, r.publish_time))
            .map(|(id, r)| summary_of(*id, r, tables))
            .collect();
        drop(state);

        sort_newest_first(&mut matched);
        let total = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(page.offset())
            .take(page.page_size)
            .map(|mut item| {
                item.finish(filter.url_column());
                item
            })
            .collect();
        Ok(page.paginate(items, total))
    }

    async fn list_columns(
        &self,
        filter: &ColumnFilter,
        page: PageRequest,
    ) -> StoreResult<Page<ColumnListing>> {
        let state = self.state.lock().await;
        let columns = &state.tables.columns;
        let names: HashMap<i64, String> = columns.values().map(|c| (c.id, c.name.clone())).collect();
        let matched: Vec<&ColumnRow> = columns.values().filter(|c| filter.matches(c)).collect();
        let total = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(page.offset())
            .take(page.page_size)
            .map(|c| ColumnListing::new(c, &names))
            .collect();
        Ok(page.paginate(items, total))
    }

    async fn apply_reference_diff(
        &self,
        columns: &TableDiff<ColumnRow>,
        sites: &TableDiff<SiteRow>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check_reference_writable()?;

        // Stage on copies and swap in only when both tables succeed.
        let mut staged_columns = state.tables.columns.clone();
        apply_diff(&mut staged_columns, columns, |c| c.id);
        if state.fail_site_writes && !sites.is_empty() {
            return Err(StoreError::Unavailable("site table write".into()));
        }
        let mut staged_sites = state.tables.sites.clone();
        apply_diff(&mut staged_sites, sites, |s| s.id);

        state.tables.columns = staged_columns;
        state.tables.sites = staged_sites;
        Ok(())
    }
}
