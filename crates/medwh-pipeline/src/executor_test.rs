use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::*;
use crate::step::StepStatus;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
    NothingToDo,
    /// Succeeds with the sum of its dependencies' `n` payload fields.
    SumUpstream,
}

struct Scripted {
    name: &'static str,
    deps: &'static [&'static str],
    delay_ms: u64,
    behavior: Behavior,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Step for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.iter().map(|d| (*d).to_owned()).collect()
    }

    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutcome> {
        self.log.lock().unwrap().push(format!("start {}", self.name));
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        self.log.lock().unwrap().push(format!("end {}", self.name));
        match self.behavior {
            Behavior::Succeed => Ok(StepOutcome::Success(json!({ "n": 1 }))),
            Behavior::Fail => anyhow::bail!("{} exploded", self.name),
            Behavior::Panic => panic!("{} panicked hard", self.name),
            Behavior::NothingToDo => Ok(StepOutcome::Skipped(SkipReason::NothingToDo(
                "no new images".to_owned(),
            ))),
            Behavior::SumUpstream => {
                let total: i64 = self
                    .deps
                    .iter()
                    .filter_map(|d| ctx.upstream_payload(d))
                    .filter_map(|p| p["n"].as_i64())
                    .sum();
                Ok(StepOutcome::Success(json!({ "n": total })))
            }
        }
    }
}

struct Harness {
    log: Arc<Mutex<Vec<String>>>,
    steps: Vec<Arc<dyn Step>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            steps: Vec::new(),
        }
    }

    fn step(
        mut self,
        name: &'static str,
        deps: &'static [&'static str],
        delay_ms: u64,
        behavior: Behavior,
    ) -> Self {
        self.steps.push(Arc::new(Scripted {
            name,
            deps,
            delay_ms,
            behavior,
            log: Arc::clone(&self.log),
        }));
        self
    }

    async fn run(self, cancel: &CancellationToken) -> (Vec<StepResult>, Vec<String>) {
        let dag = Dag::new(self.steps).unwrap();
        let results = execute(&dag, Uuid::new_v4(), cancel).await;
        let log = self.log.lock().unwrap().clone();
        (results, log)
    }
}

fn result<'a>(results: &'a [StepResult], name: &str) -> &'a StepResult {
    results
        .iter()
        .find(|r| r.step_name == name)
        .unwrap_or_else(|| panic!("no result for {name}"))
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} not in log {log:?}"))
}

#[tokio::test]
async fn dependent_starts_after_all_predecessors_finish() {
    let (results, log) = Harness::new()
        .step("fast", &[], 5, Behavior::Succeed)
        .step("slow", &[], 60, Behavior::Succeed)
        .step("join", &["fast", "slow"], 0, Behavior::SumUpstream)
        .run(&CancellationToken::new())
        .await;

    assert!(position(&log, "start join") > position(&log, "end slow"));
    assert!(position(&log, "start join") > position(&log, "end fast"));
    // Independent steps overlap.
    assert!(position(&log, "start slow") < position(&log, "end fast"));
    assert_eq!(result(&results, "join").detail, json!({ "n": 2 }));
    assert_eq!(results.len(), 3);
    assert_eq!(results.last().unwrap().step_name, "join");
}

#[tokio::test]
async fn failure_skips_dependents_and_spares_other_branches() {
    let (results, log) = Harness::new()
        .step("init_database", &[], 0, Behavior::Succeed)
        .step("collect:a", &["init_database"], 5, Behavior::Fail)
        .step("load:a", &["collect:a"], 0, Behavior::Succeed)
        .step("collect:b", &["init_database"], 20, Behavior::Succeed)
        .step("load:b", &["collect:b"], 0, Behavior::Succeed)
        .step("enrich", &["load:a", "load:b"], 0, Behavior::Succeed)
        .run(&CancellationToken::new())
        .await;

    assert_eq!(result(&results, "collect:a").status, StepStatus::Failed);
    assert_eq!(
        result(&results, "collect:a").detail["error"],
        "collect:a exploded"
    );
    assert_eq!(result(&results, "collect:b").status, StepStatus::Success);
    assert_eq!(result(&results, "load:b").status, StepStatus::Success);

    for skipped in ["load:a", "enrich"] {
        let r = result(&results, skipped);
        assert_eq!(r.status, StepStatus::Skipped);
        assert_eq!(
            r.detail,
            json!({"reason": "upstream_failed", "detail": "collect:a"})
        );
        assert!(!log.contains(&format!("start {skipped}")));
    }
}

#[tokio::test]
async fn panicking_step_is_reported_as_failed() {
    let (results, _) = Harness::new()
        .step("boom", &[], 0, Behavior::Panic)
        .step("after", &["boom"], 0, Behavior::Succeed)
        .step("unrelated", &[], 0, Behavior::Succeed)
        .run(&CancellationToken::new())
        .await;

    let boom = result(&results, "boom");
    assert_eq!(boom.status, StepStatus::Failed);
    assert!(boom.detail["error"]
        .as_str()
        .unwrap()
        .contains("boom panicked hard"));
    assert_eq!(result(&results, "after").status, StepStatus::Skipped);
    assert_eq!(result(&results, "unrelated").status, StepStatus::Success);
}

#[tokio::test]
async fn nothing_to_do_skip_does_not_block_dependents() {
    let (results, log) = Harness::new()
        .step("enrich", &[], 0, Behavior::NothingToDo)
        .step("report", &["enrich"], 0, Behavior::SumUpstream)
        .run(&CancellationToken::new())
        .await;

    assert_eq!(result(&results, "enrich").status, StepStatus::Skipped);
    assert_eq!(result(&results, "report").status, StepStatus::Success);
    assert_eq!(result(&results, "report").detail, json!({ "n": 0 }));
    assert!(log.contains(&"start report".to_owned()));
}

#[tokio::test]
async fn cancelled_run_skips_steps_not_yet_started() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (results, log) = Harness::new()
        .step("init_database", &[], 0, Behavior::Succeed)
        .step("collect:a", &["init_database"], 0, Behavior::Succeed)
        .run(&cancel)
        .await;

    assert!(log.is_empty());
    for r in &results {
        assert_eq!(r.status, StepStatus::Skipped);
        assert_eq!(r.detail, json!({"reason": "cancelled"}));
    }
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn every_step_gets_exactly_one_result() {
    let (results, _) = Harness::new()
        .step("a", &[], 0, Behavior::Succeed)
        .step("b", &["a"], 0, Behavior::Fail)
        .step("c", &["b"], 0, Behavior::Succeed)
        .step("d", &["c"], 0, Behavior::Succeed)
        .run(&CancellationToken::new())
        .await;

    let mut names: Vec<&str> = results.iter().map(|r| r.step_name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
    assert_eq!(
        result(&results, "d").detail,
        json!({"reason": "upstream_failed", "detail": "b"})
    );
    assert!(results.iter().all(|r| r.detail != Value::Null));
}
