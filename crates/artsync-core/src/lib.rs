//! Core domain model for migrating articles from the legacy site-group store.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

mod extension;
mod query;
mod reference;

pub use extension::{ExtensionFields, EXTENSION_FIELD_NAMES, EXTENSION_SLOTS};
pub use query::{
    parse_id_list, parse_query_time, path_ids, render_column_path, sort_newest_first,
    ArticleFilter, ArticleSummary, ColumnFilter, ColumnListing, Page, PageRequest, QueryError,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, ROOT_COLUMN_LABEL,
};
pub use reference::{diff_by_id, ColumnRow, ReferenceRow, SiteRow, TableDiff};

pub const CRATE_NAME: &str = "artsync-core";

/// Partition filters applied when enumerating references. `None` means "all".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFilter {
    pub site_id: Option<String>,
    pub column_id: Option<String>,
}

impl PartitionFilter {
    pub fn is_empty(&self) -> bool {
        self.site_id.is_none() && self.column_id.is_none()
    }
}

/// Lightweight pointer to one article, produced by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReference {
    pub id: String,
    pub site_id: Option<String>,
    pub column_id: Option<String>,
}

impl RecordReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            site_id: None,
            column_id: None,
        }
    }
}

/// Which object a mirror edge hangs off: a folder (seed) or another column (transitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorKind {
    Folder,
    Column,
}

impl MirrorKind {
    /// Value of `mappingTypeId` in the legacy data-source table.
    pub fn code(self) -> i32 {
        match self {
            MirrorKind::Folder => 0,
            MirrorKind::Column => 1,
        }
    }
}

/// A column (category) through which an article is exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryNode {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
}

impl CategoryNode {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            site_id: None,
        }
    }

    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "attachmentName")]
    pub name: String,
    #[serde(rename = "attachmentPath")]
    pub path: String,
}

/// Full article as read from the source store and enriched before persisting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub site_id: String,
    pub site_name: String,
    pub folder_id: String,
    pub title: String,
    pub short_title: String,
    pub auxiliary_title: String,
    pub creator_name: String,
    pub summary: String,
    pub publish_time: Option<NaiveDateTime>,
    pub last_modify_time: Option<NaiveDateTime>,
    pub publisher_name: String,
    pub publish_org_name: String,
    pub first_img_path: String,
    pub image_dir: String,
    pub file_path: String,
    pub create_time: String,
    pub visit_count: i64,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Ascending by column id, no duplicates.
    pub exposure: Vec<CategoryNode>,
    pub extension: ExtensionFields,
    pub access_url: Option<String>,
}

impl Record {
    pub fn numeric_id(&self) -> Option<i64> {
        self.id.trim().parse().ok()
    }

    pub fn exposure_ids(&self) -> Vec<i64> {
        self.exposure.iter().map(|c| c.id).collect()
    }
}

/// Creating-site lookup data used to derive public URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub domain_name: String,
    pub dummy_name: String,
    pub parent_id: String,
}

/// One `article_dynamic` row: the article as seen through one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureRow {
    pub article_id: i64,
    pub column_id: i64,
    pub column_name: String,
    pub site_id: String,
    pub site_name: String,
    pub url: Option<String>,
}

/// Everything the destination needs to replace one article atomically.
#[derive(Debug, Clone)]
pub struct ArticleWrite<'a> {
    pub article_id: i64,
    pub record: &'a Record,
    pub exposures: Vec<ExposureRow>,
}

/// Per-batch outcome counts. Merging is field-wise addition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl BatchResult {
    /// A batch that could not be run at all: every reference counts as an error.
    pub fn all_failed(len: usize) -> Self {
        Self {
            processed: 0,
            skipped: 0,
            errors: len,
        }
    }

    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.errors
    }

    pub fn merge(&mut self, other: &BatchResult) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

impl Add for BatchResult {
    type Output = BatchResult;

    fn add(mut self, rhs: BatchResult) -> BatchResult {
        self.merge(&rhs);
        self
    }
}

impl AddAssign for BatchResult {
    fn add_assign(&mut self, rhs: BatchResult) {
        self.merge(&rhs);
    }
}

impl Sum for BatchResult {
    fn sum<I: Iterator<Item = BatchResult>>(iter: I) -> Self {
        iter.fold(BatchResult::default(), Add::add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_results_sum_field_wise() {
        let parts = vec![
            BatchResult { processed: 3, skipped: 1, errors: 0 },
            BatchResult { processed: 0, skipped: 0, errors: 2 },
            BatchResult::all_failed(5),
        ];
        let total: BatchResult = parts.iter().copied().sum();
        assert_eq!(total, BatchResult { processed: 3, skipped: 1, errors: 7 });
        assert_eq!(total.total(), 11);

        let reversed: BatchResult = parts.into_iter().rev().sum();
        assert_eq!(reversed, total);
    }

    #[test]
    fn numeric_id_tolerates_whitespace() {
        let record = Record { id: " 42 ".into(), ..Default::default() };
        assert_eq!(record.numeric_id(), Some(42));
        let bad = Record { id: "abc".into(), ..Default::default() };
        assert_eq!(bad.numeric_id(), None);
    }

    #[test]
    fn mirror_kind_codes_match_legacy_mapping_type() {
        assert_eq!(MirrorKind::Folder.code(), 0);
        assert_eq!(MirrorKind::Column.code(), 1);
    }
}
