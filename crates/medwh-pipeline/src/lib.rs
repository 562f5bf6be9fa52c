pub mod builder;
pub mod dag;
pub mod error;
pub mod executor;
pub mod loader;
pub mod report;
pub mod run;
pub mod sensor;
pub mod step;
pub mod steps;

pub use builder::{standard_dag, PipelineScope, RunOptions};
pub use dag::Dag;
pub use error::PipelineError;
pub use executor::execute;
pub use loader::{load, LoadReport, RecordSink, RejectedRecord};
pub use report::{RunReport, RunState, StepResult};
pub use run::{
    acquire_run_lock, release_run_lock, run_pipeline, run_pipeline_locked, RunOutput,
};
pub use sensor::{RunRequest, SensorDecision, SensorTick, NEW_DATA_SENSOR};
pub use step::{SkipReason, Step, StepContext, StepOutcome, StepStatus};
pub use steps::PipelineResources;
