//! Enrichment output (`image_detections`) and the pending-image work queue.

use chrono::{DateTime, Utc};
use medwh_core::DetectionRecord;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::DbError;

/// An image referenced by a stored record.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingMediaRow {
    pub message_id: i64,
    pub source_id: String,
    pub media_reference: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DetectionRow {
    pub message_id: i64,
    pub source_id: String,
    pub media_reference: String,
    pub detected_objects: serde_json::Value,
    pub detection_count: i32,
    pub image_category: String,
    pub processed_at: DateTime<Utc>,
}

/// Lists images that still need classification.
///
/// An image is pending when neither an `image_detections` row nor an
/// `image_skips` row exists for its `(message_id, source_id,
/// media_reference)`. With `reprocess` set every image with a media
/// reference is returned.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_pending_media(
    pool: &PgPool,
    reprocess: bool,
) -> Result<Vec<PendingMediaRow>, DbError> {
    let rows = sqlx::query_as::<_, PendingMediaRow>(
        "SELECT r.message_id, r.source_id, r.media_reference \
         FROM raw_records r \
         WHERE r.media_reference IS NOT NULL \
           AND ($1 OR NOT EXISTS ( \
               SELECT 1 FROM image_detections d \
               WHERE d.message_id = r.message_id \
                 AND d.source_id = r.source_id \
                 AND d.media_reference = r.media_reference) \
               AND NOT EXISTS ( \
               SELECT 1 FROM image_skips s \
               WHERE s.message_id = r.message_id \
                 AND s.source_id = r.source_id \
                 AND s.media_reference = r.media_reference)) \
         ORDER BY r.source_id, r.message_ts, r.message_id",
    )
    .bind(reprocess)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Inserts or replaces the detection result for one image.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn upsert_detection(pool: &PgPool, record: &DetectionRecord) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO image_detections \
             (message_id, source_id, media_reference, detected_objects, detection_count, \
              image_category, processed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (message_id, source_id, media_reference) DO UPDATE SET \
             detected_objects = EXCLUDED.detected_objects, \
             detection_count  = EXCLUDED.detection_count, \
             image_category   = EXCLUDED.image_category, \
             processed_at     = EXCLUDED.processed_at",
    )
    .bind(record.message_id)
    .bind(&record.source_id)
    .bind(&record.media_reference)
    .bind(Json(&record.detected_objects))
    .bind(record.detection_count)
    .bind(record.category.as_str())
    .bind(record.processed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Records that an image cannot be classified, so it stops being pending.
///
/// A repeated skip refreshes `reason` and `skipped_at`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn record_image_skip(
    pool: &PgPool,
    message_id: i64,
    source_id: &str,
    media_reference: &str,
    reason: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO image_skips (message_id, source_id, media_reference, reason) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (message_id, source_id, media_reference) DO UPDATE SET \
             reason     = EXCLUDED.reason, \
             skipped_at = NOW()",
    )
    .bind(message_id)
    .bind(source_id)
    .bind(media_reference)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(())
}

/// Number of images recorded as unclassifiable.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn count_image_skips(pool: &PgPool) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM image_skips")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Fetches the detection row for one image.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if the image has not been classified, or
/// [`DbError::Sqlx`] if the query fails.
pub async fn get_detection(
    pool: &PgPool,
    message_id: i64,
    source_id: &str,
    media_reference: &str,
) -> Result<DetectionRow, DbError> {
    sqlx::query_as::<_, DetectionRow>(
        "SELECT message_id, source_id, media_reference, detected_objects, detection_count, \
                image_category, processed_at \
         FROM image_detections \
         WHERE message_id = $1 AND source_id = $2 AND media_reference = $3",
    )
    .bind(message_id)
    .bind(source_id)
    .bind(media_reference)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Returns `(image_category, count)` pairs over all stored detections.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn count_detections_by_category(pool: &PgPool) -> Result<Vec<(String, i64)>, DbError> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT image_category, COUNT(*) \
         FROM image_detections \
         GROUP BY image_category \
         ORDER BY image_category",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
