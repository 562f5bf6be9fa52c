//! Idempotent writes of collected messages into `raw_records` and `media_assets`.

use chrono::{DateTime, Utc};
use medwh_core::{RecordKey, StagedRecord};
use sqlx::{PgPool, Postgres, Transaction};

use crate::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawRecordRow {
    pub id: i64,
    pub message_id: i64,
    pub source_id: String,
    pub message_ts: DateTime<Utc>,
    pub message_text: String,
    pub has_media: bool,
    pub media_reference: Option<String>,
    pub view_count: i64,
    pub forward_count: i64,
    pub collected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upserts a batch of staged records inside a single transaction.
///
/// Conflicts on `(message_id, source_id)` overwrite the mutable fields; the
/// message timestamp is immutable once stored. Either every record in the
/// batch is committed or none is. Returns the number of records written.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if any statement or the commit fails. Use
/// [`DbError::is_data_error`] to tell record-level rejections apart from
/// infrastructure failures.
pub async fn upsert_staged_batch(pool: &PgPool, batch: &[StagedRecord]) -> Result<u64, DbError> {
    let mut tx = pool.begin().await?;
    let mut written = 0_u64;

    for staged in batch {
        upsert_raw_record(&mut tx, staged).await?;
        if let Some(media) = &staged.media {
            sqlx::query(
                "INSERT INTO media_assets \
                     (message_id, source_id, media_reference, content_sha256, byte_size) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (message_id, source_id, media_reference) DO UPDATE SET \
                     content_sha256 = EXCLUDED.content_sha256, \
                     byte_size      = EXCLUDED.byte_size",
            )
            .bind(media.message_id)
            .bind(&media.source_id)
            .bind(&media.media_reference)
            .bind(&media.content_sha256)
            .bind(media.byte_size)
            .execute(&mut *tx)
            .await?;
        }
        written += 1;
    }

    tx.commit().await?;
    Ok(written)
}

async fn upsert_raw_record(
    tx: &mut Transaction<'_, Postgres>,
    staged: &StagedRecord,
) -> Result<(), DbError> {
    let record = &staged.record;
    sqlx::query(
        "INSERT INTO raw_records \
             (message_id, source_id, message_ts, message_text, has_media, media_reference, \
              view_count, forward_count, collected_at, raw_payload) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT (message_id, source_id) DO UPDATE SET \
             message_text    = EXCLUDED.message_text, \
             has_media       = EXCLUDED.has_media, \
             media_reference = EXCLUDED.media_reference, \
             view_count      = EXCLUDED.view_count, \
             forward_count   = EXCLUDED.forward_count, \
             collected_at    = EXCLUDED.collected_at, \
             raw_payload     = EXCLUDED.raw_payload, \
             updated_at      = NOW()",
    )
    .bind(record.message_id)
    .bind(&record.source_id)
    .bind(record.timestamp)
    .bind(&record.text)
    .bind(record.has_media)
    .bind(record.media_reference.as_deref())
    .bind(record.view_count)
    .bind(record.forward_count)
    .bind(record.collected_at)
    .bind(&record.raw_payload)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Fetches a stored record by its composite key.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no row matches, or [`DbError::Sqlx`] if
/// the query fails.
pub async fn get_raw_record(pool: &PgPool, key: &RecordKey) -> Result<RawRecordRow, DbError> {
    sqlx::query_as::<_, RawRecordRow>(
        "SELECT id, message_id, source_id, message_ts, message_text, has_media, \
                media_reference, view_count, forward_count, collected_at, updated_at \
         FROM raw_records \
         WHERE message_id = $1 AND source_id = $2",
    )
    .bind(key.message_id)
    .bind(&key.source_id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Counts stored records, optionally restricted to one source.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn count_raw_records(pool: &PgPool, source_id: Option<&str>) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM raw_records WHERE $1::TEXT IS NULL OR source_id = $1",
    )
    .bind(source_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}
