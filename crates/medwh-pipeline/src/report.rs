//! Run report aggregated after every step is terminal.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::step::{StepOutcome, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    PartiallyCompleted,
}

impl RunState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::PartiallyCompleted => "partially_completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    #[must_use]
    pub fn new(step_name: String, outcome: &StepOutcome, timestamp: DateTime<Utc>) -> Self {
        Self {
            step_name,
            status: outcome.status(),
            detail: outcome.detail(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub state: RunState,
    pub steps: Vec<StepResult>,
    /// True only when every step succeeded; a skipped step counts against it.
    pub overall_success: bool,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunReport {
    #[must_use]
    pub fn build(
        run_id: Uuid,
        trigger: &str,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        steps: Vec<StepResult>,
    ) -> Self {
        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
        let succeeded = count(StepStatus::Success);
        let skipped = count(StepStatus::Skipped);
        let failed = count(StepStatus::Failed);
        let overall_success = succeeded == steps.len();

        Self {
            run_id,
            trigger: trigger.to_owned(),
            started_at,
            completed_at,
            state: if overall_success {
                RunState::Completed
            } else {
                RunState::PartiallyCompleted
            },
            steps,
            overall_success,
            succeeded,
            skipped,
            failed,
        }
    }

    /// `pipeline_report_<YYYYmmdd_HHMMSS>_<run8>.json`: the run's start time
    /// plus the first eight hex digits of its id, so runs starting in the
    /// same second keep separate files.
    #[must_use]
    pub fn file_name(&self) -> String {
        let id = self.run_id.simple().to_string();
        format!(
            "pipeline_report_{}_{}.json",
            self.started_at.format("%Y%m%d_%H%M%S"),
            &id[..8]
        )
    }

    /// Writes the report as pretty JSON into `reports_dir` and returns the
    /// file path. The file is replaced atomically.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] on filesystem failures.
    pub async fn write_to(&self, reports_dir: &Path) -> Result<PathBuf, PipelineError> {
        tokio::fs::create_dir_all(reports_dir)
            .await
            .map_err(|e| PipelineError::io(reports_dir, e))?;

        let path = reports_dir.join(self.file_name());
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| PipelineError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| PipelineError::io(&path, e))?;
        Ok(path)
    }
}
