use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, SubsecRound, Utc};
use medwh_collector::{partitions_modified_since, read_staged_file};
use medwh_core::StagedRecord;
use serde_json::json;

use crate::loader;
use crate::step::{SkipReason, Step, StepContext, StepOutcome};

use super::{collect_step_name, load_step_name, CollectSummary, PipelineResources};

/// File mtimes come from a coarse kernel clock; rescanning a short overlap
/// is absorbed by the idempotent upsert.
const RESCAN_OVERLAP_SECS: i64 = 1;

/// Watermark under which a source's last complete load of the staging area
/// is recorded.
#[must_use]
pub fn staged_load_watermark(source_id: &str) -> String {
    format!("staged_load:{source_id}")
}

/// Loads the files staged by the matching collect step, plus any partition
/// of the same source changed since its last complete load, and advances
/// the source cursor as far as the committed data allows.
pub struct LoadStep {
    name: String,
    collect_name: String,
    source_id: String,
    resources: Arc<PipelineResources>,
}

impl LoadStep {
    #[must_use]
    pub fn new(source_id: &str, resources: Arc<PipelineResources>) -> Self {
        Self {
            name: load_step_name(source_id),
            collect_name: collect_step_name(source_id),
            source_id: source_id.to_owned(),
            resources,
        }
    }
}

#[async_trait]
impl Step for LoadStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.collect_name.clone()]
    }

    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutcome> {
        let payload = ctx
            .upstream_payload(&self.collect_name)
            .with_context(|| format!("{} produced no result", self.collect_name))?;
        let summary: CollectSummary = serde_json::from_value(payload.clone())
            .with_context(|| format!("unreadable result from {}", self.collect_name))?;

        let pool = &self.resources.pool;
        let load_started = Utc::now().trunc_subsecs(6);
        let marker = staged_load_watermark(&self.source_id);
        let loaded_through = medwh_db::get_watermark(pool, &marker).await?;
        let messages_dir = self.resources.config.messages_dir();

        let own: BTreeSet<PathBuf> = summary.staged_files.iter().cloned().collect();
        let mut files = own.clone();
        files.extend(
            partitions_modified_since(&messages_dir, &self.source_id, loaded_through).await?,
        );

        let mut by_id: HashMap<i64, StagedRecord> = HashMap::with_capacity(summary.records);
        let mut unreadable_files = 0usize;
        let mut foreign_records = 0usize;
        for path in &files {
            let staged = match read_staged_file(path).await {
                Ok(staged) => staged,
                Err(e) if !own.contains(path) => {
                    tracing::warn!(
                        source = %self.source_id,
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable staged file"
                    );
                    unreadable_files += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            for record in staged {
                if record.record.source_id == self.source_id {
                    by_id.insert(record.record.message_id, record);
                } else {
                    foreign_records += 1;
                }
            }
        }
        if foreign_records > 0 {
            tracing::warn!(
                source = %self.source_id,
                foreign_records,
                "ignored staged records belonging to another source"
            );
        }

        let mut records: Vec<StagedRecord> = by_id.into_values().collect();
        records.sort_by(|a, b| {
            (a.record.timestamp, a.record.message_id)
                .cmp(&(b.record.timestamp, b.record.message_id))
        });

        let report = loader::load(
            &records,
            self.resources.config.loader_batch_size,
            pool,
            ctx.cancel(),
        )
        .await;

        let cursor = match report.cursor_target(summary.window.end) {
            Some(target) => {
                // Staged files from outside the pass may hold newer records.
                let target = target.min(summary.window.end);
                let last_message_id = if report.is_complete() {
                    summary.last_message_id
                } else {
                    report.prefix_last_message_id
                };
                Some(
                    medwh_db::advance_source_cursor(pool, &self.source_id, target, last_message_id)
                        .await?,
                )
            }
            None => None,
        };

        if let Some(fatal) = &report.fatal {
            anyhow::bail!(
                "load of {} stopped after {} of {} batches (cursor {}): {fatal}",
                self.source_id,
                report.committed_batches,
                report.total_batches,
                cursor.map_or_else(|| "unchanged".to_owned(), |c| c.to_rfc3339()),
            );
        }
        if report.cancelled {
            return Ok(StepOutcome::Skipped(SkipReason::Cancelled));
        }
        let rescan_from = load_started - Duration::seconds(RESCAN_OVERLAP_SECS);
        medwh_db::advance_watermark(pool, &marker, rescan_from).await?;

        tracing::info!(
            source = %self.source_id,
            records = report.committed_records,
            rejected = report.rejected.len(),
            "load complete"
        );
        Ok(StepOutcome::Success(json!({
            "source_id": self.source_id,
            "records_loaded": report.committed_records,
            "batches": report.committed_batches,
            "files_loaded": files.len() - unreadable_files,
            "external_files": files.difference(&own).count(),
            "unreadable_files": unreadable_files,
            "rejected": report.rejected,
            "cursor": cursor,
        })))
    }
}
