//! Access-URL and media-path derivation.
//!
//! The string helpers are pure; [`RecordEnricher`] feeds them with site lookups.

use std::sync::Arc;

use artsync_core::{CategoryNode, Record};
use artsync_storage::SourceStore;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::{debug, warn};

use crate::error::EnrichError;

pub const IMAGE_MARKER: &str = "/_upload/article/images/";

/// First non-empty entry of a domain list. Entries are separated by `,` or `，`; with
/// `lenient` whitespace and `;` separate entries too.
pub fn first_domain(list: &str, lenient: bool) -> Option<String> {
    list.split(|c: char| c == ',' || c == '，' || (lenient && (c.is_whitespace() || c == ';')))
        .map(str::trim)
        .find(|part| !part.is_empty())
        .map(str::to_string)
}

/// `YYYY/MMDD` from the creation timestamp. Unparseable values come back verbatim.
pub fn date_path(create_time: &str) -> Option<String> {
    let raw = create_time.trim();
    if raw.is_empty() {
        return None;
    }
    let rendered = if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        ts.format("%Y/%m%d").to_string()
    } else if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        ts.format("%Y/%m%d").to_string()
    } else if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        date.format("%Y/%m%d").to_string()
    } else {
        raw.to_string()
    };
    Some(rendered)
}

/// `{domain}/{path}/c{column}a{article}/page.htm`, with `http://` when the domain has no scheme.
pub fn build_visit_url(domain: &str, url_path: &str, column_id: i64, article_id: &str) -> Option<String> {
    let domain = domain.trim();
    if domain.is_empty() || url_path.is_empty() {
        return None;
    }
    let path = url_path.replace('-', "/");
    let domain = if has_scheme(domain) {
        domain.to_string()
    } else {
        format!("http://{domain}")
    };
    Some(format!(
        "{}/{path}/c{column_id}a{article_id}/page.htm",
        domain.trim_end_matches('/')
    ))
}

fn has_scheme(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Prefixes the lead image with the site domain, inserting the image directory when the path
/// is relative to it. Absolute URLs and paths already carrying the domain are returned
/// unchanged, so rewriting twice is a no-op.
pub fn process_image_path(first_img_path: &str, file_path: &str, domain: Option<&str>) -> String {
    if first_img_path.is_empty() || has_scheme(first_img_path) {
        return first_img_path.to_string();
    }
    let domain = domain.filter(|d| !d.is_empty());
    if let Some(d) = domain {
        let host = d.trim_end_matches('/');
        if first_img_path
            .strip_prefix(host)
            .is_some_and(|rest| rest.starts_with('/'))
        {
            return first_img_path.to_string();
        }
    }

    if first_img_path.contains(IMAGE_MARKER) {
        return match domain {
            Some(d) => format!("{d}{first_img_path}"),
            None => first_img_path.to_string(),
        };
    }

    let normalized = format!("/{}", first_img_path.trim_start_matches('/'));
    match domain {
        Some(d) => format!("{d}{IMAGE_MARKER}{file_path}{normalized}"),
        None => normalized,
    }
}

/// The part of a server name before `/main.`, used as the attachment host.
pub fn attachment_prefix(server_name: &str) -> &str {
    server_name
        .split_once("/main.")
        .map_or(server_name, |(head, _)| head)
}

pub fn prefix_attachment_path(path: &str, prefix: &str) -> String {
    if path.is_empty() || prefix.is_empty() || has_scheme(path) || path.starts_with(prefix) {
        return path.to_string();
    }
    format!("{prefix}{path}")
}

#[derive(Clone)]
pub struct RecordEnricher {
    source: Arc<dyn SourceStore>,
}

impl RecordEnricher {
    pub fn new(source: Arc<dyn SourceStore>) -> Self {
        Self { source }
    }

    /// Fills the access URL and rewrites media paths. Attachments are hosted on the creating
    /// site's domain.
    pub async fn enrich(&self, record: Record) -> Result<Record, EnrichError> {
        self.enrich_inner(record, None).await
    }

    /// Like [`enrich`](Self::enrich) with attachments hosted on `server_name`.
    pub async fn enrich_with_server(&self, record: Record, server_name: &str) -> Result<Record, EnrichError> {
        self.enrich_inner(record, Some(server_name)).await
    }

    async fn enrich_inner(&self, mut record: Record, server_name: Option<&str>) -> Result<Record, EnrichError> {
        if record.id.trim().is_empty() {
            return Err(EnrichError::MissingId);
        }
        let base_domain = self.base_domain(&record.site_id).await;

        if record.access_url.as_deref().map_or(true, str::is_empty) {
            record.access_url = self.derive_access_url(&record).await;
        }

        record.first_img_path =
            process_image_path(&record.first_img_path, &record.file_path, base_domain.as_deref());

        let host = server_name.or(base_domain.as_deref()).map(attachment_prefix);
        if let Some(prefix) = host.filter(|p| !p.is_empty()) {
            for attachment in &mut record.attachments {
                attachment.path = prefix_attachment_path(&attachment.path, prefix);
            }
        }

        debug!(article_id = %record.id, access_url = ?record.access_url, "record enriched");
        Ok(record)
    }

    /// The site's own first domain, without parent fallback.
    pub async fn base_domain(&self, site_id: &str) -> Option<String> {
        if site_id.is_empty() {
            return None;
        }
        match self.source.site(site_id).await {
            Ok(site) => site.and_then(|s| first_domain(&s.domain_name, false)),
            Err(err) => {
                warn!(site_id, error = %err, "site lookup failed");
                None
            }
        }
    }

    /// Domain used for page URLs: the site's own, else its parent's plus a site segment.
    pub async fn url_domain(&self, site_id: &str) -> Option<String> {
        if site_id.is_empty() {
            return None;
        }
        let site = match self.source.site(site_id).await {
            Ok(site) => site?,
            Err(err) => {
                warn!(site_id, error = %err, "site lookup failed");
                return None;
            }
        };
        if let Some(domain) = first_domain(&site.domain_name, false) {
            return Some(domain);
        }
        if site.parent_id.trim().is_empty() {
            return None;
        }

        let parent = match self.source.parent_domain(site.parent_id.trim()).await {
            Ok(parent) => parent.and_then(|d| first_domain(&d, true))?,
            Err(err) => {
                warn!(site_id, parent_id = %site.parent_id, error = %err, "parent domain lookup failed");
                return None;
            }
        };
        let segment = if site.dummy_name.trim().is_empty() {
            format!("_s{site_id}")
        } else {
            site.dummy_name.trim().to_string()
        };
        Some(format!("{}/{segment}", parent.trim_end_matches('/')))
    }

    /// The node's own site, else the column's site from the source.
    pub async fn site_of_column(&self, node: &CategoryNode) -> Option<String> {
        if let Some(site) = node.site_id.as_ref().filter(|s| !s.is_empty()) {
            return Some(site.clone());
        }
        match self.source.column_site(node.id).await {
            Ok(site) => site.filter(|s| !s.is_empty()),
            Err(err) => {
                warn!(column_id = node.id, error = %err, "column site lookup failed");
                None
            }
        }
    }

    /// The first exposure column, unless one belongs to the creating site.
    pub async fn preferred_column(&self, record: &Record) -> Option<i64> {
        let first = record.exposure.first()?.id;
        if record.site_id.is_empty() {
            return Some(first);
        }
        for node in &record.exposure {
            if self.site_of_column(node).await.as_deref() == Some(record.site_id.as_str()) {
                return Some(node.id);
            }
        }
        Some(first)
    }

    /// Page URL of the record as published under `column_id` of `site_id`.
    pub async fn column_url(&self, record: &Record, site_id: &str, column_id: i64) -> Option<String> {
        let domain = self.url_domain(site_id).await?;
        let path = date_path(&record.create_time)?;
        build_visit_url(&domain, &path, column_id, &record.id)
    }

    async fn derive_access_url(&self, record: &Record) -> Option<String> {
        let column_id = self.preferred_column(record).await?;
        self.column_url(record, &record.site_id, column_id).await
    }
}
