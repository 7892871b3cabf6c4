//! Read-side queries over the destination tables: filtered article pages and column listings.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;

use crate::{Attachment, ColumnRow, ExposureRow};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Display name of the root column that every rendered column path starts from.
pub const ROOT_COLUMN_LABEL: &str = "系统站点";

const ROOT_COLUMN_ID: i64 = 1;

/// Stored publish times are Beijing wall-clock time.
const STORE_UTC_OFFSET_SECS: i32 = 8 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("invalid {field}: {value:?}")]
    InvalidTime { field: &'static str, value: String },
    #[error("article id must be numeric: {0:?}")]
    InvalidArticleId(String),
}

/// One-based page number and page size. Out-of-range sizes fall back to the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: i64, page_size: i64) -> Self {
        let page_size = usize::try_from(page_size)
            .ok()
            .filter(|size| (1..=MAX_PAGE_SIZE).contains(size))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let page = usize::try_from(page).ok().filter(|p| *p >= 1).unwrap_or(1);
        Self { page, page_size }
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn has_next(&self, total: u64) -> bool {
        (self.page.saturating_mul(self.page_size) as u64) < total
    }

    pub fn paginate<T>(&self, items: Vec<T>, total: u64) -> Page<T> {
        Page {
            found: !items.is_empty(),
            items,
            page: self.page,
            page_size: self.page_size,
            has_next: self.has_next(total),
            total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub found: bool,
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub has_next: bool,
    pub total: u64,
}

/// Comma-separated id list. Blank and non-numeric entries are dropped.
pub fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Article page filters. `columns` takes precedence over `sites`: when both are given only the
/// column filter applies. `Some(vec![])` means ids were given but none was valid, so nothing
/// matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleFilter {
    pub columns: Option<Vec<i64>>,
    pub sites: Option<Vec<String>>,
    pub article_id: Option<i64>,
    pub title: Option<String>,
    pub published_from: Option<NaiveDateTime>,
    pub published_to: Option<NaiveDateTime>,
}

impl ArticleFilter {
    /// Builds a filter from raw request parameters. Empty strings count as absent.
    pub fn from_params(
        column_ids: Option<&str>,
        site_ids: Option<&str>,
        article_id: Option<&str>,
        title: Option<&str>,
        start_time: Option<&str>,
        end_time: Option<&str>,
    ) -> Result<Self, QueryError> {
        fn present<'a>(v: Option<&'a str>) -> Option<&'a str> {
            v.map(str::trim).filter(|v| !v.is_empty())
        }

        let columns = present(column_ids).map(parse_id_list);
        let sites: Option<Vec<String>> = if columns.is_some() {
            None
        } else {
            present(site_ids).map(|raw| parse_id_list(raw).iter().map(i64::to_string).collect())
        };
        let article_id = present(article_id)
            .map(|raw| raw.parse().map_err(|_| QueryError::InvalidArticleId(raw.to_string())))
            .transpose()?;

        Ok(Self {
            columns,
            sites,
            article_id,
            title: present(title).map(str::to_string),
            published_from: present(start_time)
                .map(|raw| parse_query_time(raw, false).ok_or_else(|| invalid("startTime", raw)))
                .transpose()?,
            published_to: present(end_time)
                .map(|raw| parse_query_time(raw, true).ok_or_else(|| invalid("endTime", raw)))
                .transpose()?,
        })
    }

    /// True when an id list was given but held no usable id.
    pub fn is_unsatisfiable(&self) -> bool {
        self.columns.as_ref().is_some_and(Vec::is_empty)
            || self.sites.as_ref().is_some_and(Vec::is_empty)
    }

    /// Column whose association url replaces the article's visit url in results.
    pub fn url_column(&self) -> Option<i64> {
        self.columns.as_ref().and_then(|ids| ids.first().copied())
    }

    /// Static-row predicates; the column and site filters are checked against associations.
    pub fn matches_static(
        &self,
        article_id: i64,
        title: &str,
        publish_time: Option<NaiveDateTime>,
    ) -> bool {
        if self.article_id.is_some_and(|id| id != article_id) {
            return false;
        }
        if let Some(needle) = &self.title {
            if !title.contains(needle.as_str()) {
                return false;
            }
        }
        if self.published_from.is_some() || self.published_to.is_some() {
            let Some(at) = publish_time else {
                return false;
            };
            if self.published_from.is_some_and(|from| at < from)
                || self.published_to.is_some_and(|to| at > to)
            {
                return false;
            }
        }
        true
    }
}

fn invalid(field: &'static str, value: &str) -> QueryError {
    QueryError::InvalidTime {
        field,
        value: value.to_string(),
    }
}

/// Accepts RFC 3339 (converted to store time), `YYYY-MM-DD HH:MM:SS` and bare dates. A bare date
/// covers the whole day: midnight as a lower bound, 23:59:59 as an upper one.
pub fn parse_query_time(raw: &str, end_of_day: bool) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let store_offset = FixedOffset::east_opt(STORE_UTC_OFFSET_SECS)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&store_offset).naive_local());
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S %:z") {
        return Some(ts.with_timezone(&store_offset).naive_local());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(ts);
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
}

/// One article as returned by a page query, with its associations ascending by column id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleSummary {
    pub article_id: i64,
    pub title: String,
    pub summary: String,
    pub creator_name: String,
    pub publish_time: Option<NaiveDateTime>,
    pub last_modify_time: Option<NaiveDateTime>,
    pub first_img_path: String,
    pub content: String,
    pub visit_url: Option<String>,
    pub visit_count: i64,
    pub columns: Vec<ExposureRow>,
    pub attachments: Vec<Attachment>,
}

impl ArticleSummary {
    /// Sorts associations and, under a column filter, prefers that column's url.
    pub fn finish(&mut self, url_column: Option<i64>) {
        self.columns.sort_by_key(|c| c.column_id);
        let Some(column_id) = url_column else {
            return;
        };
        let preferred = self
            .columns
            .iter()
            .find(|c| c.column_id == column_id)
            .and_then(|c| c.url.as_deref())
            .filter(|url| !url.is_empty());
        if let Some(url) = preferred {
            self.visit_url = Some(url.to_string());
        }
    }
}

/// Newest first; unpublished articles last; ties broken by descending id.
pub fn sort_newest_first(items: &mut [ArticleSummary]) {
    items.sort_by(|a, b| {
        match (a.publish_time, b.publish_time) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then(b.article_id.cmp(&a.article_id))
    });
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnFilter {
    pub sites: Vec<i64>,
    pub parent_id: Option<i64>,
    pub name: Option<String>,
    /// Top-level columns only: parented to the root (or to nothing), excluding the root itself.
    pub roots_only: bool,
}

impl ColumnFilter {
    pub fn matches(&self, column: &ColumnRow) -> bool {
        (self.sites.is_empty() || self.sites.contains(&column.site_id))
            && self.parent_id.map_or(true, |parent| column.parent_id == parent)
            && self
                .name
                .as_deref()
                .map_or(true, |needle| column.name.contains(needle))
            && (!self.roots_only
                || (matches!(column.parent_id, 0 | ROOT_COLUMN_ID) && column.id != ROOT_COLUMN_ID))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnListing {
    pub column_id: i64,
    pub column_name: String,
    pub parent_column_id: i64,
    pub column_url: String,
    /// Ancestor names joined under the root label, e.g. `/系统站点/News/Campus`.
    pub path: String,
    pub sort: i64,
    /// Navigation flag: non-zero columns are shown in site navigation.
    pub status: i64,
}

impl ColumnListing {
    pub fn new(column: &ColumnRow, names: &HashMap<i64, String>) -> Self {
        Self {
            column_id: column.id,
            column_name: column.name.clone(),
            parent_column_id: column.parent_id,
            column_url: column.link.clone(),
            path: render_column_path(column, names),
            sort: column.sort,
            status: column.navigation,
        }
    }
}

/// Numeric ids of a stored `/1/12/34/` style path, in order.
pub fn path_ids(path: &str) -> Vec<i64> {
    path.trim_matches('/')
        .split('/')
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Replaces the numeric path with column names under the root label. The root id and ids
/// without a known name are skipped.
pub fn render_column_path(column: &ColumnRow, names: &HashMap<i64, String>) -> String {
    if column.path.is_empty() {
        return String::new();
    }
    if column.id == ROOT_COLUMN_ID {
        return format!("/{ROOT_COLUMN_LABEL}");
    }
    let named: Vec<&str> = path_ids(&column.path)
        .iter()
        .filter(|id| **id != ROOT_COLUMN_ID)
        .filter_map(|id| names.get(id).map(String::as_str))
        .collect();
    if named.is_empty() {
        format!("/{ROOT_COLUMN_LABEL}/{}", column.name)
    } else {
        format!("/{ROOT_COLUMN_LABEL}/{}/{}", named.join("/"), column.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_outside_bounds_falls_back_to_default() {
        assert_eq!(PageRequest::new(1, 0).page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(PageRequest::new(1, 101).page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(PageRequest::new(1, 100).page_size, 100);
        assert_eq!(PageRequest::new(-3, 10), PageRequest { page: 1, page_size: 10 });

        let third = PageRequest::new(3, 10);
        assert_eq!(third.offset(), 20);
        assert!(third.has_next(31));
        assert!(!third.has_next(30));
    }

    #[test]
    fn column_filter_wins_over_site_filter() {
        let filter =
            ArticleFilter::from_params(Some("10, x,20"), Some("100"), None, None, None, None).unwrap();
        assert_eq!(filter.columns, Some(vec![10, 20]));
        assert_eq!(filter.sites, None);
        assert_eq!(filter.url_column(), Some(10));

        let sites = ArticleFilter::from_params(Some(" "), Some("100,abc"), None, None, None, None).unwrap();
        assert_eq!(sites.sites, Some(vec!["100".to_string()]));

        let nothing = ArticleFilter::from_params(Some("abc"), None, None, None, None, None).unwrap();
        assert!(nothing.is_unsatisfiable());
    }

    #[test]
    fn bare_dates_cover_the_whole_day() {
        let filter = ArticleFilter::from_params(
            None,
            None,
            None,
            None,
            Some("2025-04-01"),
            Some("2025-04-30"),
        )
        .unwrap();
        let at = |s: &str| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(filter.published_from, Some(at("2025-04-01 00:00:00")));
        assert_eq!(filter.published_to, Some(at("2025-04-30 23:59:59")));
        assert!(filter.matches_static(1, "t", Some(at("2025-04-30 23:00:00"))));
        assert!(!filter.matches_static(1, "t", Some(at("2025-05-01 00:00:00"))));
        assert!(!filter.matches_static(1, "t", None));

        // UTC input is shifted to store time
        assert_eq!(
            parse_query_time("2025-04-01T00:00:00Z", false),
            Some(at("2025-04-01 08:00:00"))
        );
    }

    #[test]
    fn bad_parameters_are_rejected() {
        assert_eq!(
            ArticleFilter::from_params(None, None, Some("12a"), None, None, None),
            Err(QueryError::InvalidArticleId("12a".into()))
        );
        assert!(matches!(
            ArticleFilter::from_params(None, None, None, None, Some("yesterday"), None),
            Err(QueryError::InvalidTime { field: "startTime", .. })
        ));
    }

    #[test]
    fn filtered_column_url_replaces_visit_url() {
        let row = |column_id, url: Option<&str>| ExposureRow {
            article_id: 5,
            column_id,
            column_name: String::new(),
            site_id: "100".into(),
            site_name: String::new(),
            url: url.map(str::to_string),
        };
        let mut article = ArticleSummary {
            article_id: 5,
            visit_url: Some("http://a.edu/default.htm".into()),
            columns: vec![row(30, Some("http://a.edu/c30.htm")), row(20, Some(""))],
            ..Default::default()
        };
        article.finish(Some(20));
        assert_eq!(article.visit_url.as_deref(), Some("http://a.edu/default.htm"));
        article.finish(Some(30));
        assert_eq!(article.visit_url.as_deref(), Some("http://a.edu/c30.htm"));
        assert_eq!(article.columns[0].column_id, 20);
    }

    #[test]
    fn unpublished_articles_sort_last() {
        let at = |d: u32| NaiveDate::from_ymd_opt(2025, 4, d).and_then(|d| d.and_hms_opt(0, 0, 0));
        let item = |id, publish_time| ArticleSummary {
            article_id: id,
            publish_time,
            ..Default::default()
        };
        let mut items = vec![item(1, None), item(2, at(1)), item(3, at(2)), item(4, at(1)), item(5, None)];
        sort_newest_first(&mut items);
        let ids: Vec<_> = items.iter().map(|a| a.article_id).collect();
        assert_eq!(ids, vec![3, 4, 2, 5, 1]);
    }

    #[test]
    fn column_paths_render_ancestor_names() {
        let names: HashMap<i64, String> = [
            (1, ROOT_COLUMN_LABEL.to_string()),
            (12, "News".to_string()),
            (34, "Campus".to_string()),
        ]
        .into_iter()
        .collect();
        let column = |id, name: &str, path: &str| ColumnRow {
            id,
            name: name.into(),
            path: path.into(),
            ..Default::default()
        };
        assert_eq!(render_column_path(&column(1, "root", "/"), &names), "/系统站点");
        assert_eq!(
            render_column_path(&column(56, "Events", "/1/12/34/"), &names),
            "/系统站点/News/Campus/Events"
        );
        assert_eq!(render_column_path(&column(56, "Events", "/"), &names), "/系统站点/Events");
        assert_eq!(render_column_path(&column(56, "Events", ""), &names), "");
    }

    #[test]
    fn roots_only_skips_the_root_column() {
        let filter = ColumnFilter {
            roots_only: true,
            ..Default::default()
        };
        let column = |id, parent_id| ColumnRow {
            id,
            parent_id,
            ..Default::default()
        };
        assert!(!filter.matches(&column(1, 0)));
        assert!(filter.matches(&column(7, 0)));
        assert!(filter.matches(&column(9, 1)));
        assert!(!filter.matches(&column(8, 7)));
    }
}
