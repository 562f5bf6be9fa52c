//! Per-source sync cursors (`source_cursors`).

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceCursorRow {
    pub source_id: String,
    pub last_synced_at: DateTime<Utc>,
    pub last_message_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Returns the stored cursor for `source_id`, or `None` if the source has
/// never been synced.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_source_cursor(
    pool: &PgPool,
    source_id: &str,
) -> Result<Option<SourceCursorRow>, DbError> {
    let row = sqlx::query_as::<_, SourceCursorRow>(
        "SELECT source_id, last_synced_at, last_message_id, updated_at \
         FROM source_cursors \
         WHERE source_id = $1",
    )
    .bind(source_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Advances the cursor for `source_id` to `synced_to`.
///
/// The stored value never moves backwards: an older `synced_to` leaves the
/// cursor untouched. Returns the cursor value in effect after the update.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn advance_source_cursor(
    pool: &PgPool,
    source_id: &str,
    synced_to: DateTime<Utc>,
    last_message_id: Option<i64>,
) -> Result<DateTime<Utc>, DbError> {
    let effective = sqlx::query_scalar::<_, DateTime<Utc>>(
        "INSERT INTO source_cursors (source_id, last_synced_at, last_message_id) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (source_id) DO UPDATE SET \
             last_message_id = CASE \
                 WHEN EXCLUDED.last_synced_at >= source_cursors.last_synced_at \
                 THEN COALESCE(EXCLUDED.last_message_id, source_cursors.last_message_id) \
                 ELSE source_cursors.last_message_id \
             END, \
             last_synced_at = GREATEST(source_cursors.last_synced_at, EXCLUDED.last_synced_at), \
             updated_at = NOW() \
         RETURNING last_synced_at",
    )
    .bind(source_id)
    .bind(synced_to)
    .bind(last_message_id)
    .fetch_one(pool)
    .await?;

    Ok(effective)
}

/// Returns every stored cursor ordered by source id.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_source_cursors(pool: &PgPool) -> Result<Vec<SourceCursorRow>, DbError> {
    let rows = sqlx::query_as::<_, SourceCursorRow>(
        "SELECT source_id, last_synced_at, last_message_id, updated_at \
         FROM source_cursors \
         ORDER BY source_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
