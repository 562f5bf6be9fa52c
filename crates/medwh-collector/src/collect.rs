//! One incremental collection pass over a single source.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use medwh_core::{AppConfig, RawRecord, StagedRecord};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CollectorError;
use crate::media::store_media;
use crate::normalize::{media_kind, normalize_message, MediaKind};
use crate::rate_limit::{cancellable_sleep, retry_with_backoff, RateLimitBudget};
use crate::source::MessageSource;

/// Maximum number of pages fetched in one pass.
/// Prevents infinite loops on an upstream that keeps returning offsets.
pub const MAX_PAGES: usize = 500;

/// Time range covered by a pass. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// `[max(cursor, now - lookback_days), now]`.
    ///
    /// A cursor in the future collapses the window to `[now, now]`. A
    /// lookback beyond the representable range starts at the earliest
    /// representable instant.
    #[must_use]
    pub fn compute(cursor: Option<DateTime<Utc>>, now: DateTime<Utc>, lookback_days: u32) -> Self {
        let floor = chrono::Duration::try_days(i64::from(lookback_days))
            .and_then(|lookback| now.checked_sub_signed(lookback))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let start = cursor.map_or(floor, |c| c.max(floor)).min(now);
        Self { start, end: now }
    }

    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Request pacing, retry and rate-limit policy for a pass.
#[derive(Debug, Clone)]
pub struct CollectSettings {
    pub page_size: u32,
    pub inter_request_delay: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub max_rate_limit_waits: u32,
    pub max_rate_limit_wait_secs: u64,
}

impl CollectSettings {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            page_size: config.collector_page_size,
            inter_request_delay: Duration::from_millis(config.collector_inter_request_delay_ms),
            request_timeout: Duration::from_secs(config.collector_request_timeout_secs),
            max_retries: config.collector_max_retries,
            backoff_base_ms: config.collector_retry_backoff_base_ms,
            max_rate_limit_waits: config.collector_max_rate_limit_waits,
            max_rate_limit_wait_secs: config.collector_max_rate_limit_wait_secs,
        }
    }
}

/// Result of a successful pass.
#[derive(Debug, Clone)]
pub struct CollectedPass {
    pub source_id: String,
    pub window: Window,
    /// Sorted by `(timestamp, message_id)`, unique on `message_id`.
    pub records: Vec<StagedRecord>,
    pub pages_fetched: usize,
    pub quarantined: usize,
    pub media_downloaded: usize,
    pub media_failures: usize,
    pub rate_limit_waits: u32,
}

impl CollectedPass {
    /// Id of the newest record in the pass.
    #[must_use]
    pub fn last_message_id(&self) -> Option<i64> {
        self.records.last().map(|s| s.record.message_id)
    }
}

/// Spaces out upstream calls by the configured delay.
struct Pacer {
    delay: Duration,
    calls: usize,
}

impl Pacer {
    async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), CollectorError> {
        if self.calls > 0 && !self.delay.is_zero() {
            cancellable_sleep(self.delay, cancel).await?;
        }
        self.calls += 1;
        Ok(())
    }
}

/// Runs one collection pass for `source_id` over `window`.
///
/// Pages are pulled strictly in sequence. A rate-limit signal suspends the
/// pass for the advertised duration and repeats the same request; transient
/// failures are retried with backoff. Photos are downloaded into
/// `media_root`; a failed download keeps the record without a media
/// reference.
///
/// # Errors
///
/// - [`CollectorError::Cancelled`] if `cancel` fires.
/// - [`CollectorError::RateLimitBudgetExhausted`] if throttling exceeds the budget.
/// - [`CollectorError::PaginationLimit`] after [`MAX_PAGES`] pages.
/// - Any non-retriable or retry-exhausted upstream error from a page fetch.
pub async fn collect_pass(
    source: &dyn MessageSource,
    source_id: &str,
    window: Window,
    settings: &CollectSettings,
    media_root: &Path,
    cancel: &CancellationToken,
) -> Result<CollectedPass, CollectorError> {
    let collected_at = Utc::now();
    let mut budget = RateLimitBudget::new(
        settings.max_rate_limit_waits,
        settings.max_rate_limit_wait_secs,
    );
    let mut pacer = Pacer {
        delay: settings.inter_request_delay,
        calls: 0,
    };

    let mut by_id: HashMap<i64, RawRecord> = HashMap::new();
    let mut offset: Option<String> = None;
    let mut pages_fetched = 0usize;
    let mut quarantined = 0usize;
    let mut seen_in_window = false;

    'pages: loop {
        if cancel.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }
        if pages_fetched >= MAX_PAGES {
            return Err(CollectorError::PaginationLimit {
                source_id: source_id.to_owned(),
                max_pages: MAX_PAGES,
            });
        }

        pacer.wait(cancel).await?;
        let page = call_upstream(settings, &mut budget, source_id, cancel, || {
            source.list_messages(
                source_id,
                window.start,
                window.end,
                offset.as_deref(),
                settings.page_size,
            )
        })
        .await?;
        pages_fetched += 1;

        let next_offset = page.next_offset;
        for payload in page.messages {
            let record = match normalize_message(source_id, payload, collected_at) {
                Ok(record) => record,
                Err(e) => {
                    quarantined += 1;
                    tracing::warn!(source = source_id, error = %e, "quarantined malformed message");
                    continue;
                }
            };

            if record.timestamp > window.end {
                break 'pages;
            }
            if record.timestamp < window.start {
                if seen_in_window {
                    break 'pages;
                }
                continue;
            }
            seen_in_window = true;
            by_id.insert(record.message_id, record);
        }

        match next_offset {
            Some(next) => offset = Some(next),
            None => break,
        }
    }

    let mut records: Vec<RawRecord> = by_id.into_values().collect();
    records.sort_by(|a, b| (a.timestamp, a.message_id).cmp(&(b.timestamp, b.message_id)));

    let mut staged = Vec::with_capacity(records.len());
    let mut media_downloaded = 0usize;
    let mut media_failures = 0usize;

    for mut record in records {
        let mut media = None;
        if media_kind(&record.raw_payload) == MediaKind::Photo {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }
            pacer.wait(cancel).await?;
            match download_photo(
                source,
                source_id,
                record.message_id,
                settings,
                &mut budget,
                media_root,
                cancel,
            )
            .await
            {
                Ok(asset) => {
                    record.media_reference = Some(asset.media_reference.clone());
                    media = Some(asset);
                    media_downloaded += 1;
                }
                Err(
                    e @ (CollectorError::Cancelled
                    | CollectorError::RateLimitBudgetExhausted { .. }),
                ) => return Err(e),
                Err(e) => {
                    media_failures += 1;
                    tracing::warn!(
                        source = source_id,
                        message_id = record.message_id,
                        error = %e,
                        "media download failed; keeping record without media reference"
                    );
                }
            }
        }
        staged.push(StagedRecord { record, media });
    }

    tracing::info!(
        source = source_id,
        records = staged.len(),
        pages = pages_fetched,
        quarantined,
        media_downloaded,
        media_failures,
        rate_limit_waits = budget.waits_used(),
        "collection pass finished"
    );

    Ok(CollectedPass {
        source_id: source_id.to_owned(),
        window,
        records: staged,
        pages_fetched,
        quarantined,
        media_downloaded,
        media_failures,
        rate_limit_waits: budget.waits_used(),
    })
}

async fn download_photo(
    source: &dyn MessageSource,
    source_id: &str,
    message_id: i64,
    settings: &CollectSettings,
    budget: &mut RateLimitBudget,
    media_root: &Path,
    cancel: &CancellationToken,
) -> Result<medwh_core::MediaAsset, CollectorError> {
    let payload = call_upstream(settings, budget, source_id, cancel, || {
        source.fetch_media(source_id, message_id)
    })
    .await?;
    store_media(
        media_root,
        source_id,
        message_id,
        &payload.bytes,
        payload.content_type.as_deref(),
    )
    .await
}

/// Issues one logical upstream request under the pass's policy: a timeout per
/// attempt, backoff retries for transient failures, and budgeted waits that
/// repeat the identical request after a rate-limit signal.
async fn call_upstream<T, F, Fut>(
    settings: &CollectSettings,
    budget: &mut RateLimitBudget,
    source_id: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, CollectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollectorError>>,
{
    let timeout = settings.request_timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }

        let attempt = retry_with_backoff(settings.max_retries, settings.backoff_base_ms, || {
            let fut = op();
            async move {
                tokio::time::timeout(timeout, fut)
                    .await
                    .map_err(|_| CollectorError::Timeout {
                        context: "upstream request".to_owned(),
                        timeout_secs: timeout.as_secs(),
                    })?
            }
        });

        let result = tokio::select! {
            () = cancel.cancelled() => Err(CollectorError::Cancelled),
            result = attempt => result,
        };

        match result {
            Err(CollectorError::RateLimited {
                retry_after_secs, ..
            }) => {
                let wait = budget.admit(source_id, retry_after_secs)?;
                tracing::info!(
                    source = source_id,
                    retry_after_secs,
                    waits_used = budget.waits_used(),
                    "rate limited; suspending source"
                );
                cancellable_sleep(wait, cancel).await?;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
#[path = "collect_test.rs"]
mod tests;
