use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CollectorError;
use crate::types::{MediaPayload, MessagePage};

/// Paginated read access to a channel's history.
///
/// Implementations perform exactly one upstream request per call and report
/// throttling as [`CollectorError::RateLimited`]; retries and waits are the
/// caller's concern.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Lists messages of `source_id` with `since <= date <= until`, oldest
    /// first, starting at `offset` (`None` for the first page).
    async fn list_messages(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        offset: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage, CollectorError>;

    /// Downloads the photo attached to `message_id`.
    async fn fetch_media(
        &self,
        source_id: &str,
        message_id: i64,
    ) -> Result<MediaPayload, CollectorError>;
}
