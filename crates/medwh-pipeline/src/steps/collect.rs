use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use medwh_collector::{collect_pass, stage_pass, CollectSettings, CollectorError, Window};
use medwh_core::SourceConfig;
use serde::{Deserialize, Serialize};

use crate::step::{SkipReason, Step, StepContext, StepOutcome};

use super::{collect_step_name, PipelineResources, INIT_DATABASE};

/// Success payload of a collect step, read by the matching load step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectSummary {
    pub source_id: String,
    pub window: Window,
    pub records: usize,
    pub pages_fetched: usize,
    pub quarantined: usize,
    pub media_downloaded: usize,
    pub media_failures: usize,
    pub rate_limit_waits: u32,
    pub last_message_id: Option<i64>,
    pub staged_files: Vec<PathBuf>,
}

/// Pulls one source's new messages and stages them in the data lake.
pub struct CollectStep {
    name: String,
    source: SourceConfig,
    lookback_override: Option<u32>,
    resources: Arc<PipelineResources>,
}

impl CollectStep {
    #[must_use]
    pub fn new(
        source: SourceConfig,
        lookback_override: Option<u32>,
        resources: Arc<PipelineResources>,
    ) -> Self {
        Self {
            name: collect_step_name(&source.id),
            source,
            lookback_override,
            resources,
        }
    }
}

#[async_trait]
impl Step for CollectStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        vec![INIT_DATABASE.to_owned()]
    }

    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutcome> {
        let upstream = self
            .resources
            .source
            .as_ref()
            .context("upstream source API is not configured (set MEDWH_SOURCE_API_URL)")?;
        let source_id = self.source.id.as_str();
        let config = &self.resources.config;

        let _permit = tokio::select! {
            () = ctx.cancel().cancelled() => {
                return Ok(StepOutcome::Skipped(SkipReason::Cancelled));
            }
            permit = self.resources.collect_permits.acquire() => {
                permit.context("collect permits closed")?
            }
        };

        let cursor = medwh_db::get_source_cursor(&self.resources.pool, source_id)
            .await?
            .map(|c| c.last_synced_at);
        let lookback = self.lookback_override.unwrap_or(self.source.lookback_days);
        let window = Window::compute(cursor, Utc::now(), lookback);
        tracing::info!(
            source = source_id,
            start = %window.start,
            end = %window.end,
            "collecting"
        );

        let settings = CollectSettings::from_app_config(config);
        let pass = match collect_pass(
            upstream.as_ref(),
            source_id,
            window,
            &settings,
            &config.media_dir(),
            ctx.cancel(),
        )
        .await
        {
            Ok(pass) => pass,
            Err(CollectorError::Cancelled) => {
                return Ok(StepOutcome::Skipped(SkipReason::Cancelled));
            }
            Err(e) => return Err(e).with_context(|| format!("collection failed for {source_id}")),
        };

        let staged_files = stage_pass(&config.messages_dir(), source_id, &pass.records)
            .await
            .with_context(|| format!("staging failed for {source_id}"))?;

        let summary = CollectSummary {
            source_id: source_id.to_owned(),
            window,
            records: pass.records.len(),
            pages_fetched: pass.pages_fetched,
            quarantined: pass.quarantined,
            media_downloaded: pass.media_downloaded,
            media_failures: pass.media_failures,
            rate_limit_waits: pass.rate_limit_waits,
            last_message_id: pass.last_message_id(),
            staged_files,
        };
        tracing::info!(
            source = source_id,
            records = summary.records,
            files = summary.staged_files.len(),
            "collection staged"
        );
        Ok(StepOutcome::Success(serde_json::to_value(summary)?))
    }
}
