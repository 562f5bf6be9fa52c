//! Pipeline command handlers for the CLI.
//!
//! Each handler builds the DAG for its scope and runs it once as a tracked
//! run. Step failures end up in the run report; only bookkeeping problems
//! (lock held, database down) are returned as errors.

use std::sync::Arc;

use medwh_core::{AppConfig, SourceConfig};
use medwh_db::RunLock;
use medwh_pipeline::{
    release_run_lock, run_pipeline, run_pipeline_locked, standard_dag, Dag, PipelineError,
    PipelineResources, PipelineScope, RunOptions, RunOutput,
};
use tokio_util::sync::CancellationToken;

/// Active sources from the sources file, optionally narrowed to one id.
pub(crate) fn load_sources_for_run(
    config: &AppConfig,
    only: Option<&str>,
) -> anyhow::Result<Vec<SourceConfig>> {
    let file = medwh_core::load_sources(&config.sources_path)?;
    match only {
        Some(id) => {
            let source = file
                .find(id)
                .ok_or_else(|| PipelineError::UnknownSource(id.to_owned()))?;
            Ok(vec![source.clone()])
        }
        None => Ok(file.active()),
    }
}

fn build_dag(
    pool: &sqlx::PgPool,
    config: &Arc<AppConfig>,
    sources: &[SourceConfig],
    options: &RunOptions,
) -> Result<Dag, PipelineError> {
    let resources = Arc::new(PipelineResources::from_config(
        pool.clone(),
        Arc::clone(config),
    )?);
    standard_dag(&resources, sources, options)
}

/// Builds and runs one pipeline invocation.
pub(crate) async fn execute_run(
    pool: &sqlx::PgPool,
    config: &Arc<AppConfig>,
    sources: &[SourceConfig],
    options: &RunOptions,
    trigger: &str,
    cancel: &CancellationToken,
) -> Result<RunOutput, PipelineError> {
    let dag = build_dag(pool, config, sources, options)?;
    run_pipeline(pool, &dag, trigger, &config.reports_dir, cancel).await
}

/// Builds and runs one invocation under a run lock the caller already holds.
///
/// The lock is released on every path.
pub(crate) async fn execute_locked_run(
    pool: &sqlx::PgPool,
    config: &Arc<AppConfig>,
    sources: &[SourceConfig],
    options: &RunOptions,
    trigger: &str,
    lock: RunLock,
    cancel: &CancellationToken,
) -> Result<RunOutput, PipelineError> {
    let dag = match build_dag(pool, config, sources, options) {
        Ok(dag) => dag,
        Err(e) => {
            release_run_lock(lock).await;
            return Err(e);
        }
    };
    run_pipeline_locked(pool, lock, &dag, trigger, &config.reports_dir, cancel).await
}

pub(crate) async fn run_full(
    pool: &sqlx::PgPool,
    config: &Arc<AppConfig>,
    days_back: Option<u32>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let sources = load_sources_for_run(config, None)?;
    let options = RunOptions {
        scope: PipelineScope::Full,
        lookback_days: days_back,
        reprocess_images: false,
    };
    let output = execute_run(pool, config, &sources, &options, "manual", cancel).await?;
    print_run(&output);
    Ok(())
}

pub(crate) async fn run_collect(
    pool: &sqlx::PgPool,
    config: &Arc<AppConfig>,
    source: Option<&str>,
    days_back: Option<u32>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let sources = load_sources_for_run(config, source)?;
    if sources.is_empty() {
        println!("no active sources configured in {}", config.sources_path.display());
        return Ok(());
    }
    let options = RunOptions {
        scope: PipelineScope::Ingest,
        lookback_days: days_back,
        reprocess_images: false,
    };
    let output = execute_run(pool, config, &sources, &options, "manual", cancel).await?;
    print_run(&output);
    Ok(())
}

pub(crate) async fn run_enrich(
    pool: &sqlx::PgPool,
    config: &Arc<AppConfig>,
    reprocess: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let options = RunOptions {
        scope: PipelineScope::Enrich,
        lookback_days: None,
        reprocess_images: reprocess,
    };
    let output = execute_run(pool, config, &[], &options, "manual", cancel).await?;
    print_run(&output);
    Ok(())
}

fn print_run(output: &RunOutput) {
    let report = &output.report;
    println!(
        "run {} {} ({} succeeded, {} skipped, {} failed)",
        report.run_id,
        report.state.as_str(),
        report.succeeded,
        report.skipped,
        report.failed
    );
    println!();

    let header = format!("{:<28}{:<10}DETAIL", "STEP", "STATUS");
    println!("{header}");
    for step in &report.steps {
        println!(
            "{:<28}{:<10}{}",
            step.step_name,
            step.status.as_str(),
            crate::runs::fmt_detail(&step.detail)
        );
    }
    println!();
    println!("report: {}", output.report_path.display());
}
