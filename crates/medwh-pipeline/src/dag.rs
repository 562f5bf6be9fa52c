//! Validated dependency graph of steps.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::step::Step;

/// A set of steps whose dependency edges have been checked: names are
/// unique, every dependency exists, and there are no cycles.
pub struct Dag {
    steps: Vec<Arc<dyn Step>>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl Dag {
    /// # Errors
    ///
    /// - [`PipelineError::DuplicateStep`] if two steps share a name.
    /// - [`PipelineError::UnknownDependency`] if a dependency names no step.
    /// - [`PipelineError::Cycle`] if the edges are not acyclic.
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Result<Self, PipelineError> {
        let mut index: HashMap<String, usize> = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.name().to_owned(), i).is_some() {
                return Err(PipelineError::DuplicateStep(step.name().to_owned()));
            }
        }

        let mut dependencies = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for dependency in step.dependencies() {
                let Some(&d) = index.get(&dependency) else {
                    return Err(PipelineError::UnknownDependency {
                        step: step.name().to_owned(),
                        dependency,
                    });
                };
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let dag = Self {
            steps,
            dependencies,
            dependents,
        };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<(), PipelineError> {
        let mut pending: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.len()).filter(|&i| pending[i] == 0).collect();
        let mut visited = 0usize;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &d in &self.dependents[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if visited == self.len() {
            return Ok(());
        }
        let mut stuck: Vec<String> = (0..self.len())
            .filter(|&i| pending[i] > 0)
            .map(|i| self.steps[i].name().to_owned())
            .collect();
        stuck.sort();
        Err(PipelineError::Cycle(stuck))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub(crate) fn step(&self, i: usize) -> &Arc<dyn Step> {
        &self.steps[i]
    }

    pub(crate) fn dependencies_of(&self, i: usize) -> &[usize] {
        &self.dependencies[i]
    }

    pub(crate) fn dependents_of(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }
}

impl std::fmt::Debug for Dag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dag").field("steps", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepContext, StepOutcome};
    use async_trait::async_trait;

    struct Named {
        name: &'static str,
        deps: &'static [&'static str],
    }

    #[async_trait]
    impl Step for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.iter().map(|d| (*d).to_owned()).collect()
        }

        async fn run(&self, _ctx: &StepContext) -> anyhow::Result<StepOutcome> {
            Ok(StepOutcome::Success(serde_json::Value::Null))
        }
    }

    fn step(name: &'static str, deps: &'static [&'static str]) -> Arc<dyn Step> {
        Arc::new(Named { name, deps })
    }

    #[test]
    fn valid_graph_is_accepted() {
        let dag = Dag::new(vec![
            step("init_database", &[]),
            step("collect:a", &["init_database"]),
            step("load:a", &["collect:a"]),
            step("enrich", &["load:a"]),
        ])
        .unwrap();
        assert_eq!(dag.len(), 4);
        assert_eq!(dag.dependents_of(0), &[1]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Dag::new(vec![step("a", &[]), step("a", &[])]).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateStep(name) if name == "a"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = Dag::new(vec![step("load:a", &["collect:a"])]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnknownDependency { ref dependency, .. } if dependency == "collect:a"
        ));
    }

    #[test]
    fn cycles_are_rejected() {
        let err = Dag::new(vec![
            step("root", &[]),
            step("a", &["root", "c"]),
            step("b", &["a"]),
            step("c", &["b"]),
        ])
        .unwrap_err();
        match err {
            PipelineError::Cycle(names) => assert_eq!(names, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn repeated_dependency_counts_once() {
        let dag = Dag::new(vec![step("a", &[]), step("b", &["a", "a"])]).unwrap();
        assert_eq!(dag.dependencies_of(1), &[0]);
    }
}
