//! Error taxonomy for a harvester run.
//!
//! Everything in [`HarvestError`] is fatal: it aborts the run before the
//! watermark is advanced. Per-data-set content failures are
//! [`ContentRegistrationError`]s and per-holder attachment failures are
//! [`AttachmentSyncError`]s; both end up in the run report and are never
//! thrown.

use harvester_manifest::ManifestError;
use std::path::PathBuf;
use std::time::Duration;

/// Failure talking to a collaborator (manifest endpoint, entity service,
/// file service).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("authentication failed for `{user}`: {message}")]
    Authentication { user: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("remote call `{method}` failed: {message}")]
    Remote { method: String, message: String },

    #[error("invalid response from `{method}`: {message}")]
    InvalidResponse { method: String, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ServiceError::Transport(format!("request timed out: {err}"));
        }
        if let Some(status) = err.status() {
            return ServiceError::Status {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        ServiceError::Transport(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("failed to open mapping database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("mapping query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Fatal run error.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("fetching the resource list failed: {0}")]
    ManifestFetch(#[source] ServiceError),

    #[error("malformed resource list: {0}")]
    ManifestFormat(#[from] ManifestError),

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("entity batch submission failed: {0}")]
    BatchSubmission(#[source] ServiceError),

    #[error("data set relationship batch failed: {0}")]
    Reconciliation(#[source] ServiceError),

    #[error("watermark file {path}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watermark file {path} holds an unreadable timestamp `{value}`")]
    CorruptWatermark { path: PathBuf, value: String },

    #[error("not-synced entities file {path}: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("entity service: {0}")]
    Service(#[from] ServiceError),

    #[error("configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HarvestError>;

/// Why the content of one physical data set could not be registered.
#[derive(Debug, thiserror::Error)]
pub enum ContentRegistrationError {
    #[error("remote login failed: {0}")]
    Login(#[source] ServiceError),

    #[error("listing remote files failed: {0}")]
    Listing(#[source] ServiceError),

    #[error("downloading `{path}` failed: {source}")]
    Download {
        path: String,
        #[source]
        source: ServiceError,
    },

    #[error("`{path}`: expected {expected} bytes, received {actual}")]
    LengthMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("remote file path `{0}` escapes the data set directory")]
    UnsafePath(String),

    #[error("staging {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("moving into storage {path}: {source}")]
    StorageMove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registering the data set failed: {0}")]
    Registration(#[source] ServiceError),

    #[error("updating the data set failed: {0}")]
    Update(#[source] ServiceError),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker aborted: {0}")]
    Worker(String),
}

/// Why the attachments of one project, experiment or sample could not be
/// synchronized.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentSyncError {
    #[error("remote login failed: {0}")]
    Login(#[source] ServiceError),

    #[error("listing remote attachments failed: {0}")]
    Listing(#[source] ServiceError),

    #[error("listing local attachments failed: {0}")]
    LocalListing(#[source] ServiceError),

    #[error("downloading attachment `{file_name}` failed: {source}")]
    Download {
        file_name: String,
        #[source]
        source: ServiceError,
    },

    #[error("updating attachments failed: {0}")]
    Update(#[source] ServiceError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker aborted: {0}")]
    Worker(String),
}
