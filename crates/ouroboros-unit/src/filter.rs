//! Test selection
//!
//! A [`TestFilter`] selects test signatures before expansion. Dependencies of
//! selected tests are always pulled back in, so filtering never leaves a
//! dependency unresolved.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::metadata::TestMetadata;

/// Which tests to run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestFilter {
    /// Regex matched against the test id
    pub name_pattern: Option<String>,
    /// Test must carry at least one of these categories (empty = any)
    pub categories: Vec<String>,
    /// Test must carry none of these categories
    pub exclude_categories: Vec<String>,
}

impl TestFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn without_category(mut self, category: impl Into<String>) -> Self {
        self.exclude_categories.push(category.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name_pattern.is_none() && self.categories.is_empty() && self.exclude_categories.is_empty()
    }

    /// Compile the name pattern
    pub fn compile(&self) -> Result<CompiledFilter<'_>> {
        let pattern = self
            .name_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| EngineError::Configuration(format!("invalid name pattern: {}", e)))?;
        Ok(CompiledFilter {
            filter: self,
            pattern,
        })
    }

    /// Selected metadata plus everything it transitively depends on,
    /// in original order
    pub fn select(&self, all: Vec<TestMetadata>) -> Result<Vec<TestMetadata>> {
        if self.is_empty() {
            return Ok(all);
        }
        let compiled = self.compile()?;

        let mut selected: Vec<bool> = all.iter().map(|m| compiled.should_run(m)).collect();
        let mut frontier: Vec<usize> = (0..all.len()).filter(|i| selected[*i]).collect();
        while let Some(index) = frontier.pop() {
            let dependent = &all[index];
            for matcher in &dependent.dependencies {
                for (candidate_index, candidate) in all.iter().enumerate() {
                    if !selected[candidate_index] && matcher.matches(candidate, dependent) {
                        selected[candidate_index] = true;
                        frontier.push(candidate_index);
                    }
                }
            }
        }

        let total = all.len();
        let kept: Vec<TestMetadata> = all
            .into_iter()
            .zip(selected)
            .filter_map(|(meta, keep)| keep.then_some(meta))
            .collect();
        tracing::debug!(selected = kept.len(), total, "applied test filter");
        Ok(kept)
    }
}

/// A [`TestFilter`] with its pattern compiled
#[derive(Debug)]
pub struct CompiledFilter<'a> {
    filter: &'a TestFilter,
    pattern: Option<Regex>,
}

impl CompiledFilter<'_> {
    /// Check if test should run based on filters
    pub fn should_run(&self, meta: &TestMetadata) -> bool {
        // Check category filter
        if !self.filter.categories.is_empty() {
            let has_matching = self.filter.categories.iter().any(|c| meta.has_category(c));
            if !has_matching {
                return false;
            }
        }

        if self.filter.exclude_categories.iter().any(|c| meta.has_category(c)) {
            return false;
        }

        // Check name pattern
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&meta.id) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::FnInvoker;
    use crate::metadata::{ClassInfo, DependencyMatcher, InvokerBinding};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn ids(metas: &[TestMetadata]) -> HashSet<&str> {
        metas.iter().map(|m| m.id.as_str()).collect()
    }

    fn meta(class: &str, method: &str) -> TestMetadata {
        let invoker = Arc::new(FnInvoker::stateless(|_a, _c| async { Ok(()) }));
        TestMetadata::new(ClassInfo::new(class), method, InvokerBinding::Direct(invoker))
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let all = vec![meta("A", "x"), meta("B", "y")];
        assert_eq!(TestFilter::new().select(all).unwrap().len(), 2);
    }

    #[test]
    fn test_name_and_category_filters() {
        let all = vec![
            meta("Math", "adds").with_categories(["fast"]),
            meta("Math", "divides").with_categories(["slow"]),
            meta("Io", "reads").with_categories(["fast"]),
        ];

        let filter = TestFilter::new().with_name_pattern("^Math\\.").with_category("fast");
        let kept = filter.select(all.clone()).unwrap();
        assert_eq!(ids(&kept), HashSet::from(["Math.adds"]));

        let filter = TestFilter::new().without_category("slow");
        let kept = filter.select(all).unwrap();
        assert_eq!(ids(&kept), HashSet::from(["Math.adds", "Io.reads"]));
    }

    #[test]
    fn test_dependencies_are_pulled_in_transitively() {
        let all = vec![
            meta("Flow", "login"),
            meta("Flow", "browse").depends_on(DependencyMatcher::method("login")),
            meta("Flow", "checkout").depends_on(DependencyMatcher::method("browse")),
            meta("Other", "unrelated"),
        ];
        let filter = TestFilter::new().with_name_pattern("checkout");
        let kept = filter.select(all).unwrap();

        let order: Vec<&str> = kept.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(order, vec!["Flow.login", "Flow.browse", "Flow.checkout"]);
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let filter = TestFilter::new().with_name_pattern("(unclosed");
        assert!(matches!(filter.compile(), Err(EngineError::Configuration(_))));
    }
}
