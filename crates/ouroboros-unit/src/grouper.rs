//! Partition tests by their parallelism declaration
//!
//! Pure and stable: the same input always yields the same groups in the same
//! order. Within every group tests are ordered by priority, highest first,
//! ties kept in input order.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::executable::ExecutableTest;

/// Tests sharing one exact set of constraint keys
#[derive(Debug, Clone)]
pub struct KeyedGroup {
    pub keys: BTreeSet<String>,
    pub tests: Vec<Arc<ExecutableTest>>,
}

impl KeyedGroup {
    /// Do this group's tests exclude tests holding any of `keys`?
    pub fn conflicts_with(&self, keys: &BTreeSet<String>) -> bool {
        !self.keys.is_disjoint(keys)
    }

    /// Highest priority among the remaining tests
    pub fn top_priority(&self) -> Option<i32> {
        self.tests.iter().map(|t| t.priority()).max()
    }
}

/// Output of [`group_tests`]
#[derive(Debug, Clone, Default)]
pub struct GroupedTests {
    /// Free-running tests
    pub parallel: Vec<Arc<ExecutableTest>>,
    /// Tests that run one at a time
    pub serial: Vec<Arc<ExecutableTest>>,
    /// Keyed groups, in order of first appearance
    pub keyed: Vec<KeyedGroup>,
}

impl GroupedTests {
    pub fn len(&self) -> usize {
        self.parallel.len() + self.serial.len() + self.keyed.iter().map(|g| g.tests.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partition `tests` into parallel, serial and keyed groups
pub fn group_tests(tests: &[Arc<ExecutableTest>]) -> GroupedTests {
    let mut ordered: Vec<&Arc<ExecutableTest>> = tests.iter().collect();
    ordered.sort_by_key(|t| std::cmp::Reverse(t.priority()));

    let mut grouped = GroupedTests::default();
    for test in ordered {
        match &test.metadata().not_in_parallel {
            None => grouped.parallel.push(test.clone()),
            Some(keys) if keys.is_empty() => grouped.serial.push(test.clone()),
            Some(keys) => {
                let keys: BTreeSet<String> = keys.iter().cloned().collect();
                match grouped.keyed.iter_mut().find(|g| g.keys == keys) {
                    Some(group) => group.tests.push(test.clone()),
                    None => grouped.keyed.push(KeyedGroup {
                        keys,
                        tests: vec![test.clone()],
                    }),
                }
            }
        }
    }
    grouped
}
