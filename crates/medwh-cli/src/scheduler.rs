//! Long-running scheduler for the `daemon` command.
//!
//! Registers the daily full-pipeline job and the new-data sensor job on a
//! [`JobScheduler`], then waits for the shutdown signal. Overlapping
//! triggers are refused by the run lock; the sensor claims it before it
//! advances its watermark.

use std::sync::Arc;
use std::time::Duration;

use medwh_core::AppConfig;
use medwh_pipeline::{sensor, PipelineError, PipelineScope, RunOptions, SensorTick};
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{execute_locked_run, execute_run, load_sources_for_run};

/// Builds and starts the scheduler, then blocks until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the scheduler cannot be initialised, a job cannot be
/// registered, or the scheduler fails to start or stop.
pub(crate) async fn run_daemon(
    pool: PgPool,
    config: Arc<AppConfig>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut scheduler = build_scheduler(pool, Arc::clone(&config), cancel.clone()).await?;
    tracing::info!(
        cron = %config.schedule_cron,
        sensor_interval_secs = config.sensor_interval_secs,
        "scheduler started"
    );

    cancel.cancelled().await;
    tracing::info!("scheduler: shutting down");
    scheduler.shutdown().await?;
    Ok(())
}

async fn build_scheduler(
    pool: PgPool,
    config: Arc<AppConfig>,
    cancel: CancellationToken,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    register_daily_job(&scheduler, pool.clone(), Arc::clone(&config), cancel.clone()).await?;
    register_sensor_job(&scheduler, pool, config, cancel).await?;

    scheduler.start().await?;
    Ok(scheduler)
}

/// Register the daily full-pipeline job on `config.schedule_cron`.
///
/// Each scheduled run collects `scheduled_lookback_days` of history for
/// every active source.
async fn register_daily_job(
    scheduler: &JobScheduler,
    pool: PgPool,
    config: Arc<AppConfig>,
    cancel: CancellationToken,
) -> Result<(), JobSchedulerError> {
    let cron = config.schedule_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pool = pool.clone();
        let config = Arc::clone(&config);
        let cancel = cancel.clone();

        Box::pin(async move {
            tracing::info!("scheduler: starting daily pipeline run");
            run_scheduled(&pool, &config, &cancel).await;
        })
    })?;

    scheduler.add(job).await?;
    Ok(())
}

async fn run_scheduled(pool: &PgPool, config: &Arc<AppConfig>, cancel: &CancellationToken) {
    let sources = match load_sources_for_run(config, None) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "scheduler: failed to load sources");
            return;
        }
    };
    let options = RunOptions {
        scope: PipelineScope::Full,
        lookback_days: Some(config.scheduled_lookback_days),
        reprocess_images: false,
    };

    match execute_run(pool, config, &sources, &options, "schedule", cancel).await {
        Ok(output) => tracing::info!(
            run_id = %output.report.run_id,
            state = output.report.state.as_str(),
            "scheduler: daily pipeline run complete"
        ),
        Err(PipelineError::RunInProgress) => {
            tracing::info!("scheduler: daily run skipped, another run is in progress");
        }
        Err(e) => tracing::error!(error = %e, "scheduler: daily pipeline run failed"),
    }
}

/// Register the new-data sensor, evaluated every `sensor_interval_secs`.
async fn register_sensor_job(
    scheduler: &JobScheduler,
    pool: PgPool,
    config: Arc<AppConfig>,
    cancel: CancellationToken,
) -> Result<(), JobSchedulerError> {
    let interval = Duration::from_secs(config.sensor_interval_secs.max(1));
    let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
        let pool = pool.clone();
        let config = Arc::clone(&config);
        let cancel = cancel.clone();

        Box::pin(async move {
            sensor_cycle(&pool, &config, &cancel).await;
        })
    })?;

    scheduler.add(job).await?;
    Ok(())
}

async fn sensor_cycle(pool: &PgPool, config: &Arc<AppConfig>, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }

    let (request, lock) = match sensor::tick(pool, &config.messages_dir()).await {
        Ok(SensorTick::Run { request, lock }) => (request, lock),
        Ok(SensorTick::Skip(reason)) => {
            tracing::debug!(reason = %reason, "sensor: no run requested");
            return;
        }
        Err(PipelineError::RunInProgress) => {
            tracing::info!("sensor: new data left for the next tick, another run is in progress");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "sensor: evaluation failed");
            return;
        }
    };

    let sources = match load_sources_for_run(config, None) {
        Ok(s) => s,
        Err(e) => {
            medwh_pipeline::release_run_lock(lock).await;
            tracing::error!(error = %e, "sensor: failed to load sources");
            return;
        }
    };
    let trigger = format!("sensor:{}", request.run_key);

    match execute_locked_run(
        pool,
        config,
        &sources,
        &RunOptions::default(),
        &trigger,
        lock,
        cancel,
    )
    .await
    {
        Ok(output) => {
            // Files staged by this run must not trigger the next one.
            if let Err(e) = medwh_db::advance_watermark(
                pool,
                sensor::NEW_DATA_SENSOR,
                output.report.completed_at,
            )
            .await
            {
                tracing::warn!(error = %e, "sensor: failed to advance watermark after run");
            }
            tracing::info!(
                run_id = %output.report.run_id,
                run_key = %request.run_key,
                state = output.report.state.as_str(),
                "sensor: triggered run complete"
            );
        }
        Err(e) => tracing::error!(error = %e, run_key = %request.run_key, "sensor: triggered run failed"),
    }
}
