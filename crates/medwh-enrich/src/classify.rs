//! Per-image classification and the enrichment run over pending images.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use medwh_core::{AppConfig, DetectionRecord, RecordKey};
use medwh_db::PendingMediaRow;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::detector::Detector;
use crate::error::EnrichError;
use crate::retry::retry_with_backoff;
use crate::rules::categorize;
use crate::summary::{EnrichSummary, SummaryBuilder};

/// An image awaiting classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImage {
    pub key: RecordKey,
    pub media_reference: String,
}

impl From<PendingMediaRow> for PendingImage {
    fn from(row: PendingMediaRow) -> Self {
        Self {
            key: RecordKey {
                message_id: row.message_id,
                source_id: row.source_id,
            },
            media_reference: row.media_reference,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichSettings {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub max_concurrency: usize,
}

impl EnrichSettings {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.enrich_request_timeout_secs),
            max_retries: config.enrich_max_retries,
            backoff_base_ms: 500,
            max_concurrency: config.enrich_max_concurrency.max(1),
        }
    }
}

/// Where classified records are written.
#[async_trait]
pub trait DetectionStore: Send + Sync {
    async fn save(&self, record: &DetectionRecord) -> Result<(), EnrichError>;

    /// Takes an image that can never be classified out of the pending queue.
    async fn mark_skipped(&self, image: &PendingImage, reason: &str) -> Result<(), EnrichError>;
}

#[async_trait]
impl DetectionStore for PgPool {
    async fn save(&self, record: &DetectionRecord) -> Result<(), EnrichError> {
        medwh_db::upsert_detection(self, record).await?;
        Ok(())
    }

    async fn mark_skipped(&self, image: &PendingImage, reason: &str) -> Result<(), EnrichError> {
        medwh_db::record_image_skip(
            self,
            image.key.message_id,
            &image.key.source_id,
            &image.media_reference,
            reason,
        )
        .await?;
        Ok(())
    }
}

/// Classifies one image: reads it, calls the detector with timeout and
/// retries, and derives the category from the detected labels.
///
/// # Errors
///
/// - [`EnrichError::ImageUnreadable`] if the file cannot be read.
/// - [`EnrichError::UndecodableImage`] if the file is empty or the detector rejects it.
/// - Detector errors after retries are exhausted.
pub async fn classify(
    detector: &dyn Detector,
    image: &PendingImage,
    settings: &EnrichSettings,
) -> Result<DetectionRecord, EnrichError> {
    let path = Path::new(&image.media_reference);
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| EnrichError::ImageUnreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
    if bytes.is_empty() {
        return Err(EnrichError::UndecodableImage {
            media_reference: image.media_reference.clone(),
        });
    }

    let timeout = settings.request_timeout;
    let detections = retry_with_backoff(settings.max_retries, settings.backoff_base_ms, || {
        let fut = detector.detect(&image.media_reference, bytes.clone());
        async move {
            tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| EnrichError::Timeout {
                    timeout_secs: timeout.as_secs(),
                })?
        }
    })
    .await?;

    let category = categorize(detections.iter().map(|d| d.label.as_str()));
    Ok(DetectionRecord::new(
        &image.key,
        &image.media_reference,
        detections,
        category,
        Utc::now(),
    ))
}

/// Classifies every image in `pending` and stores the results.
///
/// The detector's health is checked first; if it is unreachable nothing is
/// processed. Images are handled with bounded concurrency. Per-image problems
/// (missing or undecodable files) are skipped and marked in the store so
/// later runs do not pick them up again; detector failures after retries are
/// counted as failed and stay pending.
///
/// # Errors
///
/// - [`EnrichError::DetectorUnavailable`] if the health check fails, or if
///   every attempted image failed at the detector.
/// - [`EnrichError::Db`] if a result or skip marker cannot be stored.
/// - [`EnrichError::Cancelled`] if `cancel` fired before all images ran.
pub async fn run_enrichment(
    pending: Vec<PendingImage>,
    detector: &dyn Detector,
    store: &dyn DetectionStore,
    settings: &EnrichSettings,
    cancel: &CancellationToken,
) -> Result<EnrichSummary, EnrichError> {
    match tokio::time::timeout(settings.request_timeout, detector.health()).await {
        Ok(Ok(())) => {}
        Ok(Err(EnrichError::DetectorUnavailable(reason))) => {
            return Err(EnrichError::DetectorUnavailable(reason));
        }
        Ok(Err(e)) => return Err(EnrichError::DetectorUnavailable(e.to_string())),
        Err(_) => {
            return Err(EnrichError::DetectorUnavailable(format!(
                "health check timed out after {}s",
                settings.request_timeout.as_secs()
            )))
        }
    }

    let mut builder = SummaryBuilder::new(pending.len());
    let results: Vec<(PendingImage, Result<DetectionRecord, EnrichError>)> =
        stream::iter(pending)
            .map(|image| async move {
                if cancel.is_cancelled() {
                    return (image, Err(EnrichError::Cancelled));
                }
                let result = match classify(detector, &image, settings).await {
                    Ok(record) => store.save(&record).await.map(|()| record),
                    Err(e) => Err(e),
                };
                (image, result)
            })
            .buffer_unordered(settings.max_concurrency.max(1))
            .collect()
            .await;

    let mut cancelled = false;
    let mut storage_error = None;
    for (image, result) in results {
        match result {
            Ok(record) => {
                tracing::debug!(
                    source = %image.key.source_id,
                    message_id = image.key.message_id,
                    category = %record.category,
                    detections = record.detection_count,
                    "image classified"
                );
                builder.record(&record);
            }
            Err(EnrichError::Cancelled) => cancelled = true,
            Err(e @ EnrichError::Db(_)) => {
                tracing::error!(media = %image.media_reference, error = %e, "failed to store detection");
                storage_error.get_or_insert(e);
            }
            Err(e) if e.is_image_error() => {
                tracing::warn!(media = %image.media_reference, error = %e, "skipping image");
                builder.skipped();
                if let Err(mark) = store.mark_skipped(&image, &e.to_string()).await {
                    tracing::error!(media = %image.media_reference, error = %mark, "failed to record skipped image");
                    storage_error.get_or_insert(mark);
                }
            }
            Err(e) => {
                tracing::warn!(media = %image.media_reference, error = %e, "detector call failed");
                builder.failed();
            }
        }
    }

    if let Some(e) = storage_error {
        return Err(e);
    }
    if cancelled {
        return Err(EnrichError::Cancelled);
    }

    let summary = builder.finish();
    if summary.images_processed == 0 && summary.images_failed > 0 {
        return Err(EnrichError::DetectorUnavailable(format!(
            "all {} detector calls failed",
            summary.images_failed
        )));
    }

    tracing::info!(
        processed = summary.images_processed,
        skipped = summary.images_skipped,
        failed = summary.images_failed,
        detections = summary.total_detections,
        "enrichment finished"
    );
    Ok(summary)
}

#[cfg(test)]
#[path = "classify_test.rs"]
mod tests;
