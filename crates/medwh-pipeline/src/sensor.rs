//! New-data sensor over the staged-messages directory.
//!
//! Each tick compares file modification times with a persisted watermark.
//! If anything is strictly newer, the tick claims the run lock and only then
//! moves the watermark forward, so the same files never trigger twice and a
//! tick that loses the lock to another run leaves them for the next tick.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use medwh_db::RunLock;
use sqlx::PgPool;

use crate::error::PipelineError;
use crate::run::{acquire_run_lock, release_run_lock};

/// Watermark name under which the sensor persists its position.
pub const NEW_DATA_SENSOR: &str = "new_data_sensor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// `new_data_<YYYYmmdd_HHMMSS>`.
    pub run_key: String,
    pub new_files: usize,
    pub newest_mtime: DateTime<Utc>,
    /// Value the watermark must be advanced to before the run.
    pub next_watermark: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorDecision {
    Run(RunRequest),
    Skip(String),
}

/// Outcome of [`tick`]. A run request carries the run lock it claimed.
#[derive(Debug)]
pub enum SensorTick {
    Run { request: RunRequest, lock: RunLock },
    Skip(String),
}

/// Scans `dir` for `.json` files modified strictly after `watermark`.
///
/// # Errors
///
/// Returns [`PipelineError::Io`] if a directory or file cannot be inspected.
pub async fn evaluate(
    dir: &Path,
    watermark: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<SensorDecision, PipelineError> {
    if !tokio::fs::try_exists(dir)
        .await
        .map_err(|e| PipelineError::io(dir, e))?
    {
        return Ok(SensorDecision::Skip(format!(
            "data directory {} does not exist",
            dir.display()
        )));
    }

    let mut new_files = 0usize;
    let mut newest: Option<DateTime<Utc>> = None;
    for (_, mtime) in json_files(dir).await? {
        if watermark.is_none_or(|w| mtime > w) {
            new_files += 1;
            newest = newest.max(Some(mtime));
        }
    }

    let Some(newest_mtime) = newest else {
        return Ok(SensorDecision::Skip("no new data files found".to_owned()));
    };
    Ok(SensorDecision::Run(RunRequest {
        run_key: format!("new_data_{}", now.format("%Y%m%d_%H%M%S")),
        new_files,
        newest_mtime,
        next_watermark: newest_mtime.max(now),
    }))
}

/// Runs one sensor cycle against the stored watermark.
///
/// On new data the run lock is taken first and the watermark advanced
/// second. The caller owns the returned lock and must hand it to
/// [`run_pipeline_locked`](crate::run_pipeline_locked) or release it.
///
/// # Errors
///
/// - [`PipelineError::RunInProgress`] if another run holds the lock. The
///   watermark is left untouched.
/// - [`PipelineError::Db`] on storage failures.
/// - [`PipelineError::Io`] if the directory cannot be scanned.
pub async fn tick(pool: &PgPool, dir: &Path) -> Result<SensorTick, PipelineError> {
    let watermark = medwh_db::get_watermark(pool, NEW_DATA_SENSOR).await?;
    let request = match evaluate(dir, watermark, Utc::now()).await? {
        SensorDecision::Run(request) => request,
        SensorDecision::Skip(reason) => return Ok(SensorTick::Skip(reason)),
    };

    let lock = acquire_run_lock(pool, &format!("sensor:{}", request.run_key)).await?;
    let stored =
        match medwh_db::advance_watermark(pool, NEW_DATA_SENSOR, request.next_watermark).await {
            Ok(stored) => stored,
            Err(e) => {
                release_run_lock(lock).await;
                return Err(e.into());
            }
        };
    tracing::info!(
        run_key = %request.run_key,
        new_files = request.new_files,
        watermark = %stored,
        "sensor: new data detected"
    );
    Ok(SensorTick::Run { request, lock })
}

async fn json_files(root: &Path) -> Result<Vec<(PathBuf, DateTime<Utc>)>, PipelineError> {
    let mut found = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| PipelineError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::io(&dir, e))?
        {
            let path = entry.path();
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| PipelineError::io(&path, e))?;
            if metadata.is_dir() {
                dirs.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                let modified = metadata
                    .modified()
                    .map_err(|e| PipelineError::io(&path, e))?;
                // Watermarks are stored with microsecond precision.
                found.push((path, DateTime::<Utc>::from(modified).trunc_subsecs(6)));
            }
        }
    }
    Ok(found)
}
