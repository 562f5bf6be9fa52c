use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} from detector at {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("detector rejected image as undecodable: {media_reference}")]
    UndecodableImage { media_reference: String },

    #[error("cannot read image {path}: {source}")]
    ImageUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON deserialization error for {context}: {source}")]
    Deserialize {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("detector call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error(transparent)]
    Db(#[from] medwh_db::DbError),

    #[error("enrichment cancelled")]
    Cancelled,
}

impl EnrichError {
    /// Transient detector failures that are worth another attempt.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            EnrichError::Http(_) | EnrichError::Timeout { .. } => true,
            EnrichError::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Problems with one image that should skip it rather than fail the step.
    #[must_use]
    pub fn is_image_error(&self) -> bool {
        matches!(
            self,
            EnrichError::UndecodableImage { .. } | EnrichError::ImageUnreadable { .. }
        )
    }
}
