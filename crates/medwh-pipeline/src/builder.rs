//! Assembles the standard pipeline DAG from configuration.

use std::sync::Arc;
use std::time::Duration;

use medwh_core::SourceConfig;

use crate::dag::Dag;
use crate::error::PipelineError;
use crate::step::Step;
use crate::steps::{
    load_step_name, CollectStep, EnrichStep, InitDatabaseStep, LoadStep, PipelineResources,
    TransformStep,
};

/// Which part of the pipeline a run covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineScope {
    /// Migrations, collect and load per source, transform, enrich.
    #[default]
    Full,
    /// Migrations, then collect and load per source.
    Ingest,
    /// Image enrichment only.
    Enrich,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub scope: PipelineScope,
    /// Overrides every source's `lookback_days`.
    pub lookback_days: Option<u32>,
    /// Re-classify images that already have detections.
    pub reprocess_images: bool,
}

/// Builds the DAG:
///
/// ```text
/// init_database -> collect:<s> -> load:<s> --+--> transform
///                                             +--> enrich
/// ```
///
/// # Errors
///
/// Returns a [`PipelineError`] if the resulting graph is invalid, e.g. two
/// sources share an id.
pub fn standard_dag(
    resources: &Arc<PipelineResources>,
    sources: &[SourceConfig],
    options: &RunOptions,
) -> Result<Dag, PipelineError> {
    let config = &resources.config;
    let mut steps: Vec<Arc<dyn Step>> = Vec::new();

    if options.scope == PipelineScope::Enrich {
        steps.push(Arc::new(EnrichStep::new(
            options.reprocess_images,
            Vec::new(),
            Arc::clone(resources),
        )));
        return Dag::new(steps);
    }

    steps.push(Arc::new(InitDatabaseStep::new(resources.pool.clone())));
    let mut loads = Vec::with_capacity(sources.len());
    for source in sources {
        steps.push(Arc::new(CollectStep::new(
            source.clone(),
            options.lookback_days,
            Arc::clone(resources),
        )));
        steps.push(Arc::new(LoadStep::new(&source.id, Arc::clone(resources))));
        loads.push(load_step_name(&source.id));
    }

    if options.scope == PipelineScope::Full {
        steps.push(Arc::new(TransformStep::new(
            &config.transform_command,
            config.transform_dir.clone(),
            Duration::from_secs(config.transform_timeout_secs),
            loads.clone(),
        )));
        steps.push(Arc::new(EnrichStep::new(
            options.reprocess_images,
            loads,
            Arc::clone(resources),
        )));
    }

    Dag::new(steps)
}
