use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("another pipeline run holds the run lock")]
    RunInProgress,

    #[error("source {0} is not configured")]
    UnknownSource(String),

    #[error(transparent)]
    Db(#[from] medwh_db::DbError),

    #[error(transparent)]
    Collector(#[from] medwh_collector::CollectorError),

    #[error(transparent)]
    Enrich(#[from] medwh_enrich::EnrichError),

    #[error("failed to serialize run report: {0}")]
    ReportSerialize(#[from] serde_json::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}
