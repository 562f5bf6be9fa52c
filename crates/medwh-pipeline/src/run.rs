//! One pipeline run: lock, execute, persist.

use std::path::{Path, PathBuf};

use chrono::Utc;
use medwh_db::{PipelineRunRow, RunLock};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dag::Dag;
use crate::error::PipelineError;
use crate::executor::execute;
use crate::report::RunReport;

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub report: RunReport,
    pub report_path: PathBuf,
}

/// Executes `dag` as a single tracked run.
///
/// The run holds the cross-process run lock throughout. Its lifecycle is
/// recorded in `pipeline_runs` (pending, running, then completed or
/// partially completed), each step outcome in `pipeline_run_steps`, and the
/// final report is written to `reports_dir`. A run that aborts after it was
/// recorded ends as `failed` with the error message stored.
///
/// # Errors
///
/// - [`PipelineError::RunInProgress`] if another run holds the lock.
/// - [`PipelineError::Db`] if run bookkeeping fails.
/// - [`PipelineError::Io`] if the report file cannot be written.
pub async fn run_pipeline(
    pool: &PgPool,
    dag: &Dag,
    trigger: &str,
    reports_dir: &Path,
    cancel: &CancellationToken,
) -> Result<RunOutput, PipelineError> {
    let lock = acquire_run_lock(pool, trigger).await?;
    run_pipeline_locked(pool, lock, dag, trigger, reports_dir, cancel).await
}

/// Takes the run lock without waiting.
///
/// # Errors
///
/// [`PipelineError::RunInProgress`] if another run holds it, or
/// [`PipelineError::Db`] if the lock query fails.
pub async fn acquire_run_lock(pool: &PgPool, trigger: &str) -> Result<RunLock, PipelineError> {
    match medwh_db::try_acquire_run_lock(pool).await? {
        Some(lock) => Ok(lock),
        None => {
            tracing::warn!(trigger, "pipeline run skipped: another run is in progress");
            Err(PipelineError::RunInProgress)
        }
    }
}

/// Releases `lock`, logging instead of failing if the unlock query errors.
pub async fn release_run_lock(lock: RunLock) {
    if let Err(e) = lock.release().await {
        tracing::warn!(error = %e, "failed to release run lock cleanly");
    }
}

/// Like [`run_pipeline`], for a caller that already holds the run lock.
///
/// The lock is released when the run ends, whatever the outcome.
///
/// # Errors
///
/// As [`run_pipeline`], except that the lock is never contended here.
pub async fn run_pipeline_locked(
    pool: &PgPool,
    lock: RunLock,
    dag: &Dag,
    trigger: &str,
    reports_dir: &Path,
    cancel: &CancellationToken,
) -> Result<RunOutput, PipelineError> {
    let result = run_locked(pool, dag, trigger, reports_dir, cancel).await;
    release_run_lock(lock).await;
    result
}

async fn run_locked(
    pool: &PgPool,
    dag: &Dag,
    trigger: &str,
    reports_dir: &Path,
    cancel: &CancellationToken,
) -> Result<RunOutput, PipelineError> {
    let run_id = Uuid::new_v4();
    let run = medwh_db::create_pipeline_run(pool, run_id, trigger).await?;

    match run_recorded(pool, &run, dag, trigger, reports_dir, cancel).await {
        Ok(output) => Ok(output),
        Err(e) => {
            tracing::error!(%run_id, error = %e, "pipeline run aborted");
            if let Err(mark) = medwh_db::fail_pipeline_run(pool, run_id, &e.to_string()).await {
                tracing::warn!(%run_id, error = %mark, "failed to mark pipeline run as failed");
            }
            Err(e)
        }
    }
}

async fn run_recorded(
    pool: &PgPool,
    run: &PipelineRunRow,
    dag: &Dag,
    trigger: &str,
    reports_dir: &Path,
    cancel: &CancellationToken,
) -> Result<RunOutput, PipelineError> {
    let run_id = run.run_id;
    medwh_db::start_pipeline_run(pool, run_id).await?;
    let started_at = Utc::now();
    tracing::info!(%run_id, trigger, steps = dag.len(), "pipeline run started");

    let results = execute(dag, run_id, cancel).await;
    let report = RunReport::build(run_id, trigger, started_at, Utc::now(), results);

    let report_path = report.write_to(reports_dir).await?;
    for step in &report.steps {
        medwh_db::upsert_pipeline_run_step(
            pool,
            run.id,
            &step.step_name,
            step.status.as_str(),
            &step.detail,
            step.timestamp,
        )
        .await?;
    }
    medwh_db::complete_pipeline_run(
        pool,
        run_id,
        report.overall_success,
        &serde_json::to_value(&report)?,
    )
    .await?;

    tracing::info!(
        %run_id,
        state = report.state.as_str(),
        succeeded = report.succeeded,
        skipped = report.skipped,
        failed = report.failed,
        report = %report_path.display(),
        "pipeline run finished"
    );
    Ok(RunOutput {
        report,
        report_path,
    })
}
