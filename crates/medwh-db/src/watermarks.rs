//! Named, monotonic timestamps used by the new-data sensor.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::DbError;

/// Returns the watermark stored under `name`, if any.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_watermark(pool: &PgPool, name: &str) -> Result<Option<DateTime<Utc>>, DbError> {
    let observed = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT observed_at FROM sensor_watermarks WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(observed)
}

/// Moves the watermark forward to `observed_at` and returns the stored value.
/// An older `observed_at` leaves the watermark where it is.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn advance_watermark(
    pool: &PgPool,
    name: &str,
    observed_at: DateTime<Utc>,
) -> Result<DateTime<Utc>, DbError> {
    let stored = sqlx::query_scalar::<_, DateTime<Utc>>(
        "INSERT INTO sensor_watermarks (name, observed_at) \
         VALUES ($1, $2) \
         ON CONFLICT (name) DO UPDATE SET \
             observed_at = GREATEST(sensor_watermarks.observed_at, EXCLUDED.observed_at), \
             updated_at  = NOW() \
         RETURNING observed_at",
    )
    .bind(name)
    .bind(observed_at)
    .fetch_one(pool)
    .await?;

    Ok(stored)
}
