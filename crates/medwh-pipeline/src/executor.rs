//! Generic DAG executor.
//!
//! A step is started as soon as every dependency reached a terminal outcome.
//! Independent steps run concurrently on a [`JoinSet`]. A step whose
//! dependency failed, or was skipped for a blocking reason, is not run and
//! is recorded as skipped; unrelated branches carry on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dag::Dag;
use crate::report::StepResult;
use crate::step::{SkipReason, Step, StepContext, StepOutcome};

/// Runs every step of `dag` and returns their results in completion order.
pub async fn execute(dag: &Dag, run_id: Uuid, cancel: &CancellationToken) -> Vec<StepResult> {
    let mut outcomes: Vec<Option<StepOutcome>> = vec![None; dag.len()];
    let mut waiting_on: Vec<usize> = (0..dag.len())
        .map(|i| dag.dependencies_of(i).len())
        .collect();
    let mut ready: VecDeque<usize> = (0..dag.len()).filter(|&i| waiting_on[i] == 0).collect();
    let mut results = Vec::with_capacity(dag.len());
    let mut running: JoinSet<(usize, StepOutcome)> = JoinSet::new();

    loop {
        while let Some(i) = ready.pop_front() {
            if let Some(reason) = blocking_reason(dag, i, &outcomes, cancel) {
                finish(
                    dag,
                    i,
                    StepOutcome::Skipped(reason),
                    &mut outcomes,
                    &mut waiting_on,
                    &mut ready,
                    &mut results,
                );
                continue;
            }

            let step = Arc::clone(dag.step(i));
            let upstream: HashMap<String, StepOutcome> = dag
                .dependencies_of(i)
                .iter()
                .filter_map(|&d| {
                    outcomes[d]
                        .clone()
                        .map(|o| (dag.step(d).name().to_owned(), o))
                })
                .collect();
            let ctx = StepContext::new(run_id, upstream, cancel.clone());
            tracing::info!(%run_id, step = step.name(), "step started");
            running.spawn(async move { (i, run_isolated(step, ctx).await) });
        }

        match running.join_next().await {
            Some(Ok((i, outcome))) => finish(
                dag,
                i,
                outcome,
                &mut outcomes,
                &mut waiting_on,
                &mut ready,
                &mut results,
            ),
            Some(Err(e)) => {
                // The wrapper task never panics; only runtime shutdown lands here.
                tracing::error!(%run_id, error = %e, "step task aborted");
            }
            None => break,
        }
    }

    for (i, outcome) in outcomes.iter().enumerate() {
        if outcome.is_none() {
            let name = dag.step(i).name().to_owned();
            tracing::error!(%run_id, step = %name, "step never reached a terminal state");
            results.push(StepResult::new(
                name,
                &StepOutcome::Failed("step task aborted".to_owned()),
                Utc::now(),
            ));
        }
    }

    results
}

/// Runs one step on its own task so a panic is contained and reported as a
/// failure.
async fn run_isolated(step: Arc<dyn Step>, ctx: StepContext) -> StepOutcome {
    let handle = tokio::spawn(async move { step.run(&ctx).await });
    match handle.await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => StepOutcome::Failed(format!("{e:#}")),
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_owned());
            StepOutcome::Failed(format!("step panicked: {message}"))
        }
        Err(join_err) => StepOutcome::Failed(format!("step task aborted: {join_err}")),
    }
}

/// Decides whether step `i` must be skipped without running.
fn blocking_reason(
    dag: &Dag,
    i: usize,
    outcomes: &[Option<StepOutcome>],
    cancel: &CancellationToken,
) -> Option<SkipReason> {
    for &d in dag.dependencies_of(i) {
        match &outcomes[d] {
            Some(StepOutcome::Failed(_)) => {
                return Some(SkipReason::UpstreamFailed(dag.step(d).name().to_owned()));
            }
            Some(StepOutcome::Skipped(SkipReason::UpstreamFailed(origin))) => {
                return Some(SkipReason::UpstreamFailed(origin.clone()));
            }
            Some(StepOutcome::Skipped(SkipReason::Cancelled)) => {
                return Some(SkipReason::Cancelled);
            }
            _ => {}
        }
    }
    if cancel.is_cancelled() {
        return Some(SkipReason::Cancelled);
    }
    None
}

fn finish(
    dag: &Dag,
    i: usize,
    outcome: StepOutcome,
    outcomes: &mut [Option<StepOutcome>],
    waiting_on: &mut [usize],
    ready: &mut VecDeque<usize>,
    results: &mut Vec<StepResult>,
) {
    let name = dag.step(i).name();
    match &outcome {
        StepOutcome::Success(_) => tracing::info!(step = name, "step succeeded"),
        StepOutcome::Skipped(reason) => tracing::info!(step = name, %reason, "step skipped"),
        StepOutcome::Failed(error) => tracing::error!(step = name, %error, "step failed"),
    }

    results.push(StepResult::new(name.to_owned(), &outcome, Utc::now()));
    outcomes[i] = Some(outcome);

    for &dependent in dag.dependents_of(i) {
        waiting_on[dependent] -= 1;
        if waiting_on[dependent] == 0 {
            ready.push_back(dependent);
        }
    }
}

#[cfg(test)]
#[path = "executor_test.rs"]
mod tests;
