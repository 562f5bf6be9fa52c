//! Concrete pipeline steps and the resources they share.

mod collect;
mod enrich;
mod init_db;
mod load;
mod transform;

use std::sync::Arc;

use medwh_collector::{HttpMessageSource, MessageSource};
use medwh_core::AppConfig;
use medwh_enrich::{Detector, HttpDetector};
use sqlx::PgPool;
use tokio::sync::Semaphore;

use crate::error::PipelineError;

pub use collect::{CollectStep, CollectSummary};
pub use enrich::EnrichStep;
pub use init_db::InitDatabaseStep;
pub use load::{staged_load_watermark, LoadStep};
pub use transform::TransformStep;

pub const INIT_DATABASE: &str = "init_database";
pub const TRANSFORM: &str = "transform";
pub const ENRICH: &str = "enrich";

#[must_use]
pub fn collect_step_name(source_id: &str) -> String {
    format!("collect:{source_id}")
}

#[must_use]
pub fn load_step_name(source_id: &str) -> String {
    format!("load:{source_id}")
}

/// Handles shared by every step of a run.
pub struct PipelineResources {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    /// `None` when no upstream API is configured; collect steps then fail.
    pub source: Option<Arc<dyn MessageSource>>,
    /// `None` when no detector endpoint is configured; enrichment then fails.
    pub detector: Option<Arc<dyn Detector>>,
    /// Bounds how many sources are collected at once.
    pub collect_permits: Arc<Semaphore>,
}

impl PipelineResources {
    /// Builds HTTP clients for the configured upstream source and detector.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Collector`] or [`PipelineError::Enrich`] if
    /// an HTTP client cannot be constructed.
    pub fn from_config(pool: PgPool, config: Arc<AppConfig>) -> Result<Self, PipelineError> {
        let source: Option<Arc<dyn MessageSource>> = match &config.source_api_url {
            Some(url) => Some(Arc::new(HttpMessageSource::new(
                url,
                config.source_api_token.clone(),
                config.collector_request_timeout_secs,
                &config.collector_user_agent,
            )?)),
            None => None,
        };
        let detector: Option<Arc<dyn Detector>> = match &config.detector_url {
            Some(url) => Some(Arc::new(HttpDetector::new(
                url,
                config.enrich_request_timeout_secs,
            )?)),
            None => None,
        };

        Ok(Self {
            pool,
            collect_permits: Arc::new(Semaphore::new(
                config.collector_max_concurrent_sources.max(1),
            )),
            config,
            source,
            detector,
        })
    }
}

impl std::fmt::Debug for PipelineResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineResources")
            .field("config", &self.config)
            .field("source", &self.source.is_some())
            .field("detector", &self.detector.is_some())
            .finish_non_exhaustive()
    }
}
