use artsync_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("article {0} not found in source")]
    NotFound(String),
    #[error("querying article {id}: {source}")]
    QueryFailed {
        id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("record has no id")]
    MissingId,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("article id {0:?} is not numeric")]
    InvalidId(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch invocation failed: {0}")]
    Invocation(String),
    #[error("batch processor panicked: {0}")]
    Panicked(String),
    #[error("batch failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<BatchError>,
    },
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid run parameters: {0}")]
    InvalidParams(String),
    #[error("enumerating references: {0}")]
    Enumerate(#[source] StoreError),
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("event for article {0:?} has an invalid id")]
    InvalidId(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Enrich(#[from] EnrichError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ReferenceSyncError {
    #[error("a reference sync is already running")]
    AlreadyRunning,
    #[error("loading {table} from {side}: {source}")]
    Load {
        table: &'static str,
        side: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("applying reference table diff: {0}")]
    Apply(#[source] StoreError),
}
