//! The uniform step contract shared by every pipeline stage.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a step did not run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// The step had no work. Dependents still run.
    NothingToDo(String),
    /// A predecessor failed; carries the name of the step that failed.
    UpstreamFailed(String),
    /// The run was cancelled before or while the step ran.
    Cancelled,
}

impl SkipReason {
    /// Whether dependents of a step skipped for this reason must be skipped too.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        !matches!(self, SkipReason::NothingToDo(_))
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NothingToDo(detail) => write!(f, "nothing to do: {detail}"),
            SkipReason::UpstreamFailed(step) => write!(f, "upstream_failed: {step}"),
            SkipReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Skipped,
    Failed,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Value),
    Skipped(SkipReason),
    Failed(String),
}

impl StepOutcome {
    #[must_use]
    pub fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Success(_) => StepStatus::Success,
            StepOutcome::Skipped(_) => StepStatus::Skipped,
            StepOutcome::Failed(_) => StepStatus::Failed,
        }
    }

    /// `true` if dependents of this step must not run.
    #[must_use]
    pub fn blocks_dependents(&self) -> bool {
        match self {
            StepOutcome::Success(_) => false,
            StepOutcome::Skipped(reason) => reason.is_blocking(),
            StepOutcome::Failed(_) => true,
        }
    }

    /// JSON detail stored in the run report for this outcome.
    #[must_use]
    pub fn detail(&self) -> Value {
        match self {
            StepOutcome::Success(payload) => payload.clone(),
            StepOutcome::Skipped(reason) => {
                serde_json::to_value(reason).unwrap_or_else(|_| Value::String(reason.to_string()))
            }
            StepOutcome::Failed(error) => serde_json::json!({ "error": error }),
        }
    }
}

/// What a step can see while running: the terminal outcomes of its direct
/// dependencies, the run id, and the run's cancellation token.
#[derive(Debug, Clone)]
pub struct StepContext {
    run_id: Uuid,
    upstream: HashMap<String, StepOutcome>,
    cancel: CancellationToken,
}

impl StepContext {
    #[must_use]
    pub fn new(
        run_id: Uuid,
        upstream: HashMap<String, StepOutcome>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            upstream,
            cancel,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    #[must_use]
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn upstream(&self, step: &str) -> Option<&StepOutcome> {
        self.upstream.get(step)
    }

    /// Success payload of a dependency, if it succeeded.
    #[must_use]
    pub fn upstream_payload(&self, step: &str) -> Option<&Value> {
        match self.upstream.get(step) {
            Some(StepOutcome::Success(payload)) => Some(payload),
            _ => None,
        }
    }
}

/// One node of the pipeline DAG.
///
/// An `Err` from [`Step::run`] is reported as a failed step.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn dependencies(&self) -> Vec<String>;

    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutcome>;
}
