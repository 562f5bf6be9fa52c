//! Run history command handlers for the CLI.
//!
//! Read-only views over `pipeline_runs` and `pipeline_run_steps`.

use chrono::{DateTime, Utc};
use clap::Subcommand;
use uuid::Uuid;

/// Sub-commands available under `runs`.
#[derive(Debug, Subcommand)]
pub enum RunsCommands {
    /// List recent pipeline runs
    List {
        /// Maximum number of runs to show
        #[arg(long, default_value = "10")]
        limit: i64,
    },
    /// Show the step outcomes of one run
    Show {
        /// Run identifier as printed by `runs list`
        run_id: Uuid,
    },
}

fn fmt_time(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(|| "-".to_owned(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// List recent pipeline runs, newest first.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub(crate) async fn run_runs_list(pool: &sqlx::PgPool, limit: i64) -> anyhow::Result<()> {
    let runs = medwh_db::list_pipeline_runs(pool, limit).await?;

    if runs.is_empty() {
        println!("no pipeline runs recorded yet; run `medwh run` first");
        return Ok(());
    }

    let header = format!(
        "{:<38}{:<22}{:<21}{:<21}TRIGGER",
        "RUN", "STATUS", "STARTED", "COMPLETED"
    );
    println!("{header}");
    for run in &runs {
        println!(
            "{:<38}{:<22}{:<21}{:<21}{}",
            run.run_id,
            run.status,
            fmt_time(run.started_at),
            fmt_time(run.completed_at),
            run.trigger_source
        );
    }

    Ok(())
}

/// Show the recorded step outcomes of a single run.
///
/// # Errors
///
/// Returns an error if the run is not found or the database query fails.
pub(crate) async fn run_runs_show(pool: &sqlx::PgPool, run_id: Uuid) -> anyhow::Result<()> {
    let run = medwh_db::get_pipeline_run(pool, run_id)
        .await
        .map_err(|e| match e {
            medwh_db::DbError::NotFound => anyhow::anyhow!("run {run_id} not found"),
            other => other.into(),
        })?;
    let steps = medwh_db::list_pipeline_run_steps(pool, run.id).await?;

    println!("Run: {} ({})", run.run_id, run.trigger_source);
    println!(
        "Status: {}{}",
        run.status,
        match run.overall_success {
            Some(true) => ", all steps succeeded",
            Some(false) => ", not all steps succeeded",
            None => "",
        }
    );
    if let Some(error) = &run.error_message {
        println!("Error: {error}");
    }
    println!();

    if steps.is_empty() {
        println!("no step outcomes recorded");
        return Ok(());
    }

    let header = format!("{:<28}{:<10}{:<21}DETAIL", "STEP", "STATUS", "FINISHED");
    println!("{header}");
    for step in &steps {
        println!(
            "{:<28}{:<10}{:<21}{}",
            step.step_name,
            step.status,
            fmt_time(Some(step.finished_at)),
            fmt_detail(&step.detail)
        );
    }

    Ok(())
}

/// Compact one-line rendering of a step detail, truncated for the terminal.
pub(crate) fn fmt_detail(detail: &serde_json::Value) -> String {
    let text = match detail {
        serde_json::Value::Null => return String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > 80 {
        format!("{}...", text.chars().take(80).collect::<String>())
    } else {
        text
    }
}

/// Show per-source cursors, warehouse totals and detection categories.
///
/// # Errors
///
/// Returns an error if any database query fails.
pub(crate) async fn run_status(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let cursors = medwh_db::list_source_cursors(pool).await?;
    let total = medwh_db::count_raw_records(pool, None).await?;
    let categories = medwh_db::count_detections_by_category(pool).await?;
    let skipped_images = medwh_db::count_image_skips(pool).await?;

    println!("raw records: {total}");
    println!();

    if cursors.is_empty() {
        println!("no sources synced yet");
    } else {
        let header = format!("{:<24}{:<21}{:<16}RECORDS", "SOURCE", "SYNCED TO", "LAST MESSAGE");
        println!("{header}");
        for cursor in &cursors {
            let records = medwh_db::count_raw_records(pool, Some(&cursor.source_id)).await?;
            println!(
                "{:<24}{:<21}{:<16}{}",
                cursor.source_id,
                fmt_time(Some(cursor.last_synced_at)),
                cursor
                    .last_message_id
                    .map_or_else(|| "-".to_owned(), |id| id.to_string()),
                records
            );
        }
    }

    if !categories.is_empty() {
        println!();
        println!("{:<24}IMAGES", "CATEGORY");
        for (category, count) in &categories {
            println!("{category:<24}{count}");
        }
    }
    if skipped_images > 0 {
        println!();
        println!("unclassifiable images: {skipped_images} (use `medwh enrich --reprocess` to retry)");
    }

    Ok(())
}
