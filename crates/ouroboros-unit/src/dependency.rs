//! Dependency resolution between expanded tests
//!
//! Each declared [`DependencyMatcher`](crate::metadata::DependencyMatcher) is
//! matched against every other expanded test. A matcher selecting nothing
//! fails the dependent test; a set of tests that can never become eligible
//! (a cycle, or waiting on one) fails with a circular-dependency diagnostic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

use crate::error::TestError;
use crate::executable::{ExecutableTest, TestResult};

/// Tests the resolver failed, by reason
#[derive(Debug, Default)]
pub struct DependencyReport {
    pub unresolved: Vec<Arc<ExecutableTest>>,
    pub circular: Vec<Arc<ExecutableTest>>,
}

impl DependencyReport {
    pub fn failed(&self) -> impl Iterator<Item = &Arc<ExecutableTest>> {
        self.unresolved.iter().chain(self.circular.iter())
    }

    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty() && self.circular.is_empty()
    }
}

/// Resolve the dependencies of every test in the set.
///
/// Tests that fail resolution are completed as Failed here.
pub fn resolve_dependencies(tests: &[Arc<ExecutableTest>]) -> DependencyReport {
    let mut report = DependencyReport::default();

    for test in tests.iter().filter(|t| !t.is_terminal()) {
        match match_dependencies(test, tests) {
            Ok(deps) => test.set_dependencies(&deps),
            Err(message) => {
                warn!(test_id = %test.id(), "{}", message);
                test.set_dependencies(&[]);
                test.complete(TestResult::not_run(test, TestError::UnresolvedDependency(message)));
                report.unresolved.push(test.clone());
            }
        }
    }

    report.circular = fail_unreachable(tests);
    report
}

fn match_dependencies(
    test: &Arc<ExecutableTest>,
    all: &[Arc<ExecutableTest>],
) -> Result<Vec<Arc<ExecutableTest>>, String> {
    let meta = test.metadata();
    let mut seen = HashSet::new();
    let mut deps = Vec::new();

    for matcher in &meta.dependencies {
        let mut matched = false;
        for candidate in all {
            if candidate.id() == test.id() || !matcher.matches(candidate.metadata(), meta) {
                continue;
            }
            matched = true;
            if seen.insert(candidate.id().to_string()) {
                deps.push(candidate.clone());
            }
        }
        if !matched {
            return Err(format!(
                "{} depends on {}, which matches no test",
                test.id(),
                matcher.describe(meta)
            ));
        }
    }
    Ok(deps)
}

/// Fixed-point pass: anything that can never become eligible is failed
fn fail_unreachable(tests: &[Arc<ExecutableTest>]) -> Vec<Arc<ExecutableTest>> {
    let mut eligible: HashSet<String> = HashSet::new();
    let mut waiting: Vec<&Arc<ExecutableTest>> = Vec::new();
    for test in tests {
        if test.is_terminal() || !test.has_dependencies() {
            eligible.insert(test.id().to_string());
        } else {
            waiting.push(test);
        }
    }

    loop {
        let before = waiting.len();
        waiting.retain(|test| {
            let ready = test.dependencies().iter().all(|d| eligible.contains(d.id()));
            if ready {
                eligible.insert(test.id().to_string());
            }
            !ready
        });
        if waiting.is_empty() || waiting.len() == before {
            break;
        }
    }

    if waiting.is_empty() {
        return Vec::new();
    }

    let graph: HashMap<String, Vec<String>> = waiting
        .iter()
        .map(|t| {
            let deps = t
                .dependencies()
                .iter()
                .map(|d| d.id().to_string())
                .filter(|id| !eligible.contains(id))
                .collect();
            (t.id().to_string(), deps)
        })
        .collect();

    waiting
        .into_iter()
        .map(|test| {
            let mut cycle = find_cycle(&graph, test.id()).unwrap_or_else(|| vec![test.id().to_string()]);
            if let Some(first) = cycle.first().cloned() {
                cycle.push(first);
            }
            warn!(test_id = %test.id(), cycle = %cycle.join(" -> "), "circular dependency");
            test.complete(TestResult::not_run(test, TestError::CircularDependency(cycle)));
            test.clone()
        })
        .collect()
}

fn find_cycle(graph: &HashMap<String, Vec<String>>, start: &str) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();
    dfs_cycle_detect(graph, start, &mut visited, &mut rec_stack, &mut path)
}

fn dfs_cycle_detect(
    graph: &HashMap<String, Vec<String>>,
    node: &str,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(node.to_string());
    rec_stack.insert(node.to_string());
    path.push(node.to_string());

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle_detect(graph, dep, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let cycle_start = path.iter().position(|n| n == dep).unwrap_or(0);
                return Some(path[cycle_start..].to_vec());
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    None
}
