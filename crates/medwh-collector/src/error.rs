use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization error for {context}: {source}")]
    Deserialize {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("rate limited by upstream for {source_id} (retry after {retry_after_secs}s)")]
    RateLimited {
        source_id: String,
        retry_after_secs: u64,
    },

    #[error("rate-limit budget exhausted for {source_id} after {waits} waits (last retry-after {retry_after_secs}s)")]
    RateLimitBudgetExhausted {
        source_id: String,
        waits: u32,
        retry_after_secs: u64,
    },

    #[error("endpoint not found: {url}")]
    NotFound { url: String },

    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("{context} timed out after {timeout_secs}s")]
    Timeout { context: String, timeout_secs: u64 },

    #[error("malformed message payload: {reason}")]
    Normalization { reason: String },

    #[error("pagination limit reached for {source_id}: exceeded {max_pages} pages")]
    PaginationLimit { source_id: String, max_pages: usize },

    #[error("invalid source base URL \"{url}\": {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("collection cancelled")]
    Cancelled,
}

impl CollectorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
