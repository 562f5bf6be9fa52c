//! Cross-process mutual exclusion for pipeline runs.
//!
//! Built on a session-level Postgres advisory lock. The lock lives on one
//! pooled connection that is held for the lifetime of [`RunLock`].

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};

use crate::DbError;

/// Advisory lock key shared by every process that runs the pipeline.
pub const PIPELINE_RUN_LOCK_KEY: i64 = 0x6d65_6477_685f_7275;

/// Proof that the caller holds the pipeline run lock.
///
/// Call [`RunLock::release`] when the run finishes. If the guard is dropped
/// instead, its connection is detached from the pool and closed, which makes
/// the server release the lock.
#[derive(Debug)]
pub struct RunLock {
    conn: Option<PoolConnection<Postgres>>,
}

/// Tries to take the pipeline run lock without waiting.
///
/// Returns `None` when another session already holds it.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if a connection cannot be acquired or the lock
/// query fails.
pub async fn try_acquire_run_lock(pool: &PgPool) -> Result<Option<RunLock>, DbError> {
    let mut conn = pool.acquire().await?;
    let locked = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
        .bind(PIPELINE_RUN_LOCK_KEY)
        .fetch_one(&mut *conn)
        .await?;

    if locked {
        Ok(Some(RunLock { conn: Some(conn) }))
    } else {
        Ok(None)
    }
}

impl RunLock {
    /// Releases the lock and returns the connection to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlx`] if the unlock query fails. The connection
    /// is closed in that case, so the lock is still released.
    pub async fn release(mut self) -> Result<(), DbError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        match sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(PIPELINE_RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!("run lock dropped without release; closing its connection");
            drop(conn.detach());
        }
    }
}
