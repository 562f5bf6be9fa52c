//! Database operations for `pipeline_runs` and `pipeline_run_steps`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbError;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row from the `pipeline_runs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineRunRow {
    pub id: i64,
    pub run_id: Uuid,
    pub trigger_source: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub overall_success: Option<bool>,
    pub report: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A row from the `pipeline_run_steps` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineRunStepRow {
    pub id: i64,
    pub pipeline_run_id: i64,
    pub step_name: String,
    pub status: String,
    pub detail: serde_json::Value,
    pub finished_at: DateTime<Utc>,
}

const RUN_COLUMNS: &str = "id, run_id, trigger_source, status, started_at, completed_at, \
                           overall_success, report, error_message, created_at";

// ---------------------------------------------------------------------------
// pipeline_runs operations
// ---------------------------------------------------------------------------

/// Creates a new pipeline run in `pending` status.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails, including when `run_id`
/// already exists.
pub async fn create_pipeline_run(
    pool: &PgPool,
    run_id: Uuid,
    trigger_source: &str,
) -> Result<PipelineRunRow, DbError> {
    let row = sqlx::query_as::<_, PipelineRunRow>(&format!(
        "INSERT INTO pipeline_runs (run_id, trigger_source, status) \
         VALUES ($1, $2, 'pending') \
         RETURNING {RUN_COLUMNS}"
    ))
    .bind(run_id)
    .bind(trigger_source)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Marks a run as `running` and sets `started_at = NOW()`.
///
/// # Errors
///
/// Returns [`DbError::InvalidPipelineRunTransition`] if the run is not
/// `pending`, or [`DbError::Sqlx`] if the update fails.
pub async fn start_pipeline_run(pool: &PgPool, run_id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = 'running', started_at = NOW() \
         WHERE run_id = $1 AND status = 'pending'",
    )
    .bind(run_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::InvalidPipelineRunTransition {
            run_id,
            expected_status: "pending",
        });
    }

    Ok(())
}

/// Moves a `running` run to its terminal status and stores the final report.
///
/// `overall_success` selects `completed`; otherwise the run ends as
/// `partially_completed`.
///
/// # Errors
///
/// Returns [`DbError::InvalidPipelineRunTransition`] if the run is not
/// `running`, or [`DbError::Sqlx`] if the update fails.
pub async fn complete_pipeline_run(
    pool: &PgPool,
    run_id: Uuid,
    overall_success: bool,
    report: &serde_json::Value,
) -> Result<(), DbError> {
    let status = if overall_success {
        "completed"
    } else {
        "partially_completed"
    };

    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = $1, completed_at = NOW(), overall_success = $2, report = $3 \
         WHERE run_id = $4 AND status = 'running'",
    )
    .bind(status)
    .bind(overall_success)
    .bind(report)
    .bind(run_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::InvalidPipelineRunTransition {
            run_id,
            expected_status: "running",
        });
    }

    Ok(())
}

/// Marks a run that aborted before completing as `failed`.
///
/// Allowed from `pending` or `running`; `completed_at` is set to `NOW()`.
///
/// # Errors
///
/// Returns [`DbError::InvalidPipelineRunTransition`] if the run already
/// finished, or [`DbError::Sqlx`] if the update fails.
pub async fn fail_pipeline_run(
    pool: &PgPool,
    run_id: Uuid,
    error_message: &str,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = 'failed', completed_at = NOW(), overall_success = false, \
             error_message = $1 \
         WHERE run_id = $2 AND status IN ('pending', 'running')",
    )
    .bind(error_message)
    .bind(run_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::InvalidPipelineRunTransition {
            run_id,
            expected_status: "pending or running",
        });
    }

    Ok(())
}

/// Fetches a single run by its public `run_id`.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no row exists, or [`DbError::Sqlx`] if
/// the query fails.
pub async fn get_pipeline_run(pool: &PgPool, run_id: Uuid) -> Result<PipelineRunRow, DbError> {
    sqlx::query_as::<_, PipelineRunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE run_id = $1"
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Returns the most recent `limit` runs, ordered by `created_at DESC`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_pipeline_runs(pool: &PgPool, limit: i64) -> Result<Vec<PipelineRunRow>, DbError> {
    let rows = sqlx::query_as::<_, PipelineRunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM pipeline_runs \
         ORDER BY created_at DESC, id DESC \
         LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// pipeline_run_steps operations
// ---------------------------------------------------------------------------

/// Inserts or updates the outcome row of one step within a run.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn upsert_pipeline_run_step(
    pool: &PgPool,
    pipeline_run_id: i64,
    step_name: &str,
    status: &str,
    detail: &serde_json::Value,
    finished_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO pipeline_run_steps \
             (pipeline_run_id, step_name, status, detail, finished_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (pipeline_run_id, step_name) DO UPDATE SET \
             status      = EXCLUDED.status, \
             detail      = EXCLUDED.detail, \
             finished_at = EXCLUDED.finished_at",
    )
    .bind(pipeline_run_id)
    .bind(step_name)
    .bind(status)
    .bind(detail)
    .bind(finished_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Returns all step rows for a run, in the order they finished.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_pipeline_run_steps(
    pool: &PgPool,
    pipeline_run_id: i64,
) -> Result<Vec<PipelineRunStepRow>, DbError> {
    let rows = sqlx::query_as::<_, PipelineRunStepRow>(
        "SELECT id, pipeline_run_id, step_name, status, detail, finished_at \
         FROM pipeline_run_steps \
         WHERE pipeline_run_id = $1 \
         ORDER BY finished_at, id",
    )
    .bind(pipeline_run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
