//! Single-article updates pushed by the site-group message bus.

use std::sync::Arc;

use artsync_core::{CategoryNode, ExposureRow};
use artsync_storage::{parse_id, DestinationStore, SourceStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::ArticlePipeline;
use crate::error::{EventError, FetchError};

pub const OPERATE_ARTICLE_UPSERT: &str = "1";
pub const OPERATE_ARTICLE_DELETE: &str = "2";
pub const OPERATE_COLUMN_ARTICLE_DELETE: &str = "7";
pub const OPERATE_COLUMN_ARTICLE_CREATE: &str = "8";
pub const OPERATE_VISIT_COUNT_CHANGE: &str = "article.visitCount.change";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ArticleEvent {
    pub operate: String,
    pub article_id: String,
    pub visit_url: String,
    pub publish_column_id: String,
    pub site_id: String,
    pub server_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Replaced,
    /// The article no longer exists in the source.
    SourceMissing,
    Deleted,
    AssociationAdded,
    AssociationExists,
    AssociationRemoved(u64),
    VisitCountsUpdated(usize),
    Ignored,
}

pub struct EventHandler {
    pipeline: ArticlePipeline,
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
}

fn event_id(raw: &str) -> Result<i64, EventError> {
    parse_id(raw).map_err(|_| EventError::InvalidId(raw.to_string()))
}

fn blank_to_none(value: &str) -> Option<String> {
    Some(value.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

impl EventHandler {
    pub fn new(source: Arc<dyn SourceStore>, destination: Arc<dyn DestinationStore>) -> Self {
        Self {
            pipeline: ArticlePipeline::new(source.clone(), destination.clone()),
            source,
            destination,
        }
    }

    pub async fn handle_payload(&self, payload: &[u8]) -> Result<EventOutcome, EventError> {
        let event: ArticleEvent = serde_json::from_slice(payload)?;
        self.handle(&event).await
    }

    pub async fn handle(&self, event: &ArticleEvent) -> Result<EventOutcome, EventError> {
        debug!(operate = %event.operate, article_id = %event.article_id, "event received");
        match event.operate.as_str() {
            OPERATE_ARTICLE_UPSERT => self.upsert(event).await,
            OPERATE_ARTICLE_DELETE => {
                let id = event_id(&event.article_id)?;
                self.pipeline.writer().delete(id).await?;
                info!(article_id = id, "article deleted");
                Ok(EventOutcome::Deleted)
            }
            OPERATE_COLUMN_ARTICLE_DELETE => {
                let id = event_id(&event.article_id)?;
                let column_id = event_id(&event.publish_column_id)?;
                let removed = self.destination.remove_association(id, column_id).await?;
                info!(article_id = id, column_id, removed, "column association removed");
                Ok(EventOutcome::AssociationRemoved(removed))
            }
            OPERATE_COLUMN_ARTICLE_CREATE => self.add_association(event).await,
            OPERATE_VISIT_COUNT_CHANGE => self.refresh_visit_counts(&event.article_id).await,
            other => {
                debug!(operate = other, "unhandled operation ignored");
                Ok(EventOutcome::Ignored)
            }
        }
    }

    /// Full replace of one article, exposed through the event's publish column only.
    async fn upsert(&self, event: &ArticleEvent) -> Result<EventOutcome, EventError> {
        let id = event_id(&event.article_id)?;

        let exposure = match parse_id(&event.publish_column_id) {
            Ok(column_id) => {
                let name = self.lookup_column_name(column_id).await;
                let mut node = CategoryNode::new(column_id, name);
                node.site_id = blank_to_none(&event.site_id);
                Some(vec![node])
            }
            Err(_) => None,
        };

        let mut record = match self
            .pipeline
            .fetcher()
            .fetch_with_exposure(&event.article_id, exposure)
            .await
        {
            Ok(record) => record,
            Err(FetchError::NotFound(_)) => {
                debug!(article_id = id, "article missing from source, event ignored");
                return Ok(EventOutcome::SourceMissing);
            }
            Err(err) => return Err(err.into()),
        };
        record.access_url = blank_to_none(&event.visit_url);

        let record = self
            .pipeline
            .enricher()
            .enrich_with_server(record, event.server_name.trim())
            .await?;
        self.pipeline.writer().replace(&record).await?;
        info!(article_id = id, "article replaced from event");
        Ok(EventOutcome::Replaced)
    }

    async fn add_association(&self, event: &ArticleEvent) -> Result<EventOutcome, EventError> {
        let id = event_id(&event.article_id)?;
        let column_id = event_id(&event.publish_column_id)?;
        if self.destination.has_association(id, column_id).await? {
            debug!(article_id = id, column_id, "association already present");
            return Ok(EventOutcome::AssociationExists);
        }

        let site_id = event.site_id.trim().to_string();
        let site_name = match self.source.site_name(&site_id).await {
            Ok(name) => name.unwrap_or_default(),
            Err(err) => {
                warn!(site_id = %site_id, error = %err, "site name lookup failed");
                String::new()
            }
        };
        let row = ExposureRow {
            article_id: id,
            column_id,
            column_name: self.lookup_column_name(column_id).await,
            site_id,
            site_name,
            url: blank_to_none(&event.visit_url),
        };
        self.destination.insert_association(&row).await?;
        info!(article_id = id, column_id, "column association added");
        Ok(EventOutcome::AssociationAdded)
    }

    /// `article_ids` is a comma list; only articles already in the destination are touched.
    async fn refresh_visit_counts(&self, article_ids: &str) -> Result<EventOutcome, EventError> {
        let ids: Vec<i64> = article_ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match s.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(value = s, "non-numeric article id in visit count event");
                    None
                }
            })
            .collect();
        if ids.is_empty() {
            return Ok(EventOutcome::VisitCountsUpdated(0));
        }

        let present = self.destination.existing_ids(&ids).await?;
        if present.is_empty() {
            debug!(requested = ids.len(), "no listed article is migrated yet");
            return Ok(EventOutcome::VisitCountsUpdated(0));
        }

        let counts = self.source.visit_counts(&present).await?;
        let mut updated = 0;
        for (article_id, visit_count) in counts {
            match self.destination.update_visit_count(article_id, visit_count).await {
                Ok(()) => updated += 1,
                Err(err) => warn!(article_id, error = %err, "visit count update failed"),
            }
        }
        info!(requested = ids.len(), updated, "visit counts refreshed");
        Ok(EventOutcome::VisitCountsUpdated(updated))
    }

    async fn lookup_column_name(&self, column_id: i64) -> String {
        match self.source.column_name(column_id).await {
            Ok(name) => name.unwrap_or_default(),
            Err(err) => {
                warn!(column_id, error = %err, "column name lookup failed");
                String::new()
            }
        }
    }
}
