use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

use crate::step::{SkipReason, Step, StepContext, StepOutcome};

use super::TRANSFORM;

const OUTPUT_TAIL_LINES: usize = 20;

/// Runs the external transformation job. Succeeds iff the command exits 0
/// within the timeout.
pub struct TransformStep {
    command: String,
    dir: PathBuf,
    timeout: Duration,
    dependencies: Vec<String>,
}

impl TransformStep {
    #[must_use]
    pub fn new(command: &str, dir: PathBuf, timeout: Duration, dependencies: Vec<String>) -> Self {
        Self {
            command: command.to_owned(),
            dir,
            timeout,
            dependencies,
        }
    }
}

#[async_trait]
impl Step for TransformStep {
    fn name(&self) -> &str {
        TRANSFORM
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutcome> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().context("transform command is empty")?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(parts)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::info!(command = %self.command, dir = %self.dir.display(), "running transform");
        let output = tokio::select! {
            () = ctx.cancel().cancelled() => {
                return Ok(StepOutcome::Skipped(SkipReason::Cancelled));
            }
            result = tokio::time::timeout(self.timeout, command.output()) => result
                .map_err(|_| anyhow::anyhow!(
                    "`{}` timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                ))?
                .with_context(|| format!("failed to start `{}`", self.command))?,
        };

        if !output.status.success() {
            anyhow::bail!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                tail(&output.stderr)
            );
        }

        Ok(StepOutcome::Success(json!({
            "command": self.command,
            "exit_code": output.status.code(),
            "output": tail(&output.stdout),
        })))
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(cancel: CancellationToken) -> StepContext {
        StepContext::new(Uuid::new_v4(), HashMap::new(), cancel)
    }

    fn step(command: &str, timeout: Duration) -> TransformStep {
        TransformStep::new(command, std::env::temp_dir(), timeout, vec![])
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let outcome = step("echo models built", Duration::from_secs(10))
            .run(&ctx(CancellationToken::new()))
            .await
            .unwrap();
        let StepOutcome::Success(payload) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(payload["exit_code"], 0);
        assert_eq!(payload["output"], "models built");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let err = step("false", Duration::from_secs(10))
            .run(&ctx(CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = step("medwh-no-such-transform-binary", Duration::from_secs(10))
            .run(&ctx(CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to start"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = step("sleep 5", Duration::from_millis(100))
            .run(&ctx(CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_skips() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = step("sleep 5", Duration::from_secs(10))
            .run(&ctx(cancel))
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Skipped(SkipReason::Cancelled));
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let kept = tail(text.as_bytes());
        assert!(kept.starts_with("line 10"));
        assert!(kept.ends_with("line 29"));
    }
}
