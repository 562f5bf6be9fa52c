use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use medwh_enrich::{run_enrichment, EnrichError, EnrichSettings, PendingImage};

use crate::step::{SkipReason, Step, StepContext, StepOutcome};

use super::{PipelineResources, ENRICH};

/// Classifies images that have no detection row yet (or all images when
/// `reprocess` is set).
pub struct EnrichStep {
    reprocess: bool,
    dependencies: Vec<String>,
    resources: Arc<PipelineResources>,
}

impl EnrichStep {
    #[must_use]
    pub fn new(
        reprocess: bool,
        dependencies: Vec<String>,
        resources: Arc<PipelineResources>,
    ) -> Self {
        Self {
            reprocess,
            dependencies,
            resources,
        }
    }
}

#[async_trait]
impl Step for EnrichStep {
    fn name(&self) -> &str {
        ENRICH
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutcome> {
        let pool = &self.resources.pool;
        let pending: Vec<PendingImage> = medwh_db::list_pending_media(pool, self.reprocess)
            .await?
            .into_iter()
            .map(PendingImage::from)
            .collect();
        if pending.is_empty() {
            return Ok(StepOutcome::Skipped(SkipReason::NothingToDo(
                "no new images".to_owned(),
            )));
        }

        let detector = self
            .resources
            .detector
            .as_ref()
            .context("object detector endpoint is not configured (set MEDWH_DETECTOR_URL)")?;
        let settings = EnrichSettings::from_app_config(&self.resources.config);
        tracing::info!(images = pending.len(), reprocess = self.reprocess, "enriching images");

        match run_enrichment(pending, detector.as_ref(), pool, &settings, ctx.cancel()).await {
            Ok(summary) => Ok(StepOutcome::Success(serde_json::to_value(summary)?)),
            Err(EnrichError::Cancelled) => Ok(StepOutcome::Skipped(SkipReason::Cancelled)),
            Err(e) => Err(e.into()),
        }
    }
}
