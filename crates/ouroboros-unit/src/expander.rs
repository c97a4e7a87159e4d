//! Test data expansion
//!
//! Turns one [`TestMetadata`] into concrete tests: the Cartesian product of
//! class rows × method rows × property values. Sources are resolved
//! concurrently; an empty factor yields no tests at all. Nesting depth and
//! total combination count are bounded, and exceeding either fails the whole
//! expansion rather than truncating it.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{ExpansionError, TestError};
use crate::executable::{ExecutableTest, TestResult};
use crate::invoker::InvokerRegistry;
use crate::metadata::{DataSource, TestMetadata};
use crate::source::{DataSourceResolver, Row};
use crate::value::{format_arguments, ArgValue};

/// Safety limits applied while expanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionLimits {
    pub max_depth: usize,
    pub max_combinations: usize,
}

impl Default for ExpansionLimits {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_combinations: 100_000,
        }
    }
}

impl From<&EngineConfig> for ExpansionLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_depth: config.max_cartesian_depth,
            max_combinations: config.max_cartesian_combinations,
        }
    }
}

/// One expanded argument combination
#[derive(Debug, Clone, PartialEq)]
pub struct Combination {
    pub class_args: Row,
    pub args: Row,
    /// Property values, in declaration order
    pub properties: Vec<(String, ArgValue)>,
    /// Class arguments then method arguments, formatted and joined
    pub display_text: String,
}

impl Combination {
    /// `base[args]<name=value, ...>`; brackets only when there is something in them
    pub fn test_id(&self, base: &str) -> String {
        let mut id = base.to_string();
        if !self.display_text.is_empty() {
            id.push('[');
            id.push_str(&self.display_text);
            id.push(']');
        }
        if !self.properties.is_empty() {
            let props: Vec<String> = self
                .properties
                .iter()
                .map(|(name, value)| format!("{}={}", name, value.format_argument()))
                .collect();
            id.push('<');
            id.push_str(&props.join(", "));
            id.push('>');
        }
        id
    }

    /// `method(args)`, or just `method` without arguments
    pub fn display_name(&self, method: &str) -> String {
        if self.display_text.is_empty() {
            method.to_string()
        } else {
            format!("{}({})", method, self.display_text)
        }
    }
}

/// Expands test metadata into executable tests
pub struct TestExpander {
    resolver: Arc<dyn DataSourceResolver>,
    invokers: Arc<InvokerRegistry>,
    limits: ExpansionLimits,
    issued: HashMap<String, usize>,
}

impl TestExpander {
    pub fn new(
        resolver: Arc<dyn DataSourceResolver>,
        invokers: Arc<InvokerRegistry>,
        limits: ExpansionLimits,
    ) -> Self {
        Self {
            resolver,
            invokers,
            limits,
            issued: HashMap::new(),
        }
    }

    /// Expand into executable tests with ids unique across this expander
    pub async fn expand(&mut self, metadata: Arc<TestMetadata>) -> Result<Vec<Arc<ExecutableTest>>, ExpansionError> {
        let invoker = metadata.invoker.resolve(&self.invokers)?;
        let combinations = self.combinations(&metadata).await?;
        debug!(test = %metadata.id, count = combinations.len(), "expanded test");

        let tests = combinations
            .into_iter()
            .map(|combo| {
                let id = self.unique_id(combo.test_id(&metadata.id));
                let display_name = combo.display_name(&metadata.method_name);
                Arc::new(ExecutableTest::new(
                    id,
                    display_name,
                    metadata.clone(),
                    combo.class_args,
                    combo.args,
                    combo.properties,
                    Some(invoker.clone()),
                ))
            })
            .collect();
        Ok(tests)
    }

    /// Already-failed stand-in for a test whose expansion failed
    pub fn expansion_failure(&mut self, metadata: Arc<TestMetadata>, error: ExpansionError) -> Arc<ExecutableTest> {
        let id = self.unique_id(metadata.id.clone());
        let placeholder = Arc::new(ExecutableTest::expansion_failure(id, metadata));
        placeholder.complete(TestResult::not_run(&placeholder, TestError::Expansion(error)));
        placeholder
    }

    fn unique_id(&mut self, id: String) -> String {
        let seen = self.issued.entry(id.clone()).or_insert(0);
        *seen += 1;
        if *seen == 1 {
            id
        } else {
            format!("{}#{}", id, seen)
        }
    }

    /// All argument combinations of a test, in product order
    pub async fn combinations(&self, metadata: &TestMetadata) -> Result<Vec<Combination>, ExpansionError> {
        let class_sources = futures::future::try_join_all(
            metadata.class_data_sources.iter().map(|s| self.resolve_source(s, 1)),
        );
        let method_sources = futures::future::try_join_all(
            metadata.data_sources.iter().map(|s| self.resolve_source(s, 1)),
        );
        let property_sources = futures::future::try_join_all(
            metadata.property_sources.iter().map(|p| self.resolve_source(&p.source, 1)),
        );
        let (class_sets, method_sets, property_sets) =
            futures::future::try_join3(class_sources, method_sources, property_sources).await?;

        // A property takes the first element of each row
        let property_sets: Vec<Vec<Row>> = property_sets
            .into_iter()
            .map(|rows| {
                rows.into_iter()
                    .map(|row| vec![row.into_iter().next().unwrap_or(ArgValue::Null)])
                    .collect()
            })
            .collect();

        let class_count = self.check_count(&class_sets)?;
        let method_count = self.check_count(&method_sets)?;
        let property_count = self.check_count(&property_sets)?;
        let total = class_count
            .checked_mul(method_count)
            .and_then(|n| n.checked_mul(property_count))
            .filter(|n| *n <= self.limits.max_combinations)
            .ok_or(ExpansionError::TooManyCombinations {
                limit: self.limits.max_combinations,
            })?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let class_rows = cartesian_product(&class_sets);
        let method_rows = cartesian_product(&method_sets);
        let property_rows = cartesian_product(&property_sets);
        let property_names: Vec<&String> = metadata.property_sources.iter().map(|p| &p.name).collect();

        let mut combinations = Vec::with_capacity(total);
        for class_args in &class_rows {
            for args in &method_rows {
                let display_text = format_arguments(
                    &class_args.iter().chain(args.iter()).cloned().collect::<Vec<_>>(),
                );
                for values in &property_rows {
                    let properties = property_names
                        .iter()
                        .map(|name| name.to_string())
                        .zip(values.iter().cloned())
                        .collect();
                    combinations.push(Combination {
                        class_args: class_args.clone(),
                        args: args.clone(),
                        properties,
                        display_text: display_text.clone(),
                    });
                }
            }
        }
        Ok(combinations)
    }

    /// Product size of `factors`, failing once it passes the combination limit
    fn check_count(&self, factors: &[Vec<Row>]) -> Result<usize, ExpansionError> {
        let mut count: usize = 1;
        for factor in factors {
            if factor.is_empty() {
                return Ok(0);
            }
            count = count
                .checked_mul(factor.len())
                .filter(|n| *n <= self.limits.max_combinations)
                .ok_or(ExpansionError::TooManyCombinations {
                    limit: self.limits.max_combinations,
                })?;
        }
        Ok(count)
    }

    fn resolve_source<'a>(
        &'a self,
        source: &'a DataSource,
        depth: usize,
    ) -> BoxFuture<'a, Result<Vec<Row>, ExpansionError>> {
        async move {
            if depth > self.limits.max_depth {
                return Err(ExpansionError::MaxDepthExceeded {
                    limit: self.limits.max_depth,
                });
            }
            match source {
                DataSource::Inline(rows) => Ok(rows.clone()),
                DataSource::Named(name) => {
                    self.resolver
                        .resolve(name)
                        .await
                        .map_err(|message| ExpansionError::DataSource {
                            source_name: name.clone(),
                            message,
                        })
                }
                DataSource::Product(inner) => {
                    let sets = futures::future::try_join_all(
                        inner.iter().map(|s| self.resolve_source(s, depth + 1)),
                    )
                    .await?;
                    if self.check_count(&sets)? == 0 {
                        return Ok(Vec::new());
                    }
                    Ok(cartesian_product(&sets))
                }
            }
        }
        .boxed()
    }
}

/// Cartesian product of row sets; each output row concatenates one row per set.
/// No sets yields a single empty row.
fn cartesian_product(sets: &[Vec<Row>]) -> Vec<Row> {
    let mut result: Vec<Row> = vec![Vec::new()];

    for set in sets {
        let mut new_result = Vec::with_capacity(result.len() * set.len());
        for existing in &result {
            for row in set {
                let mut combined = existing.clone();
                combined.extend(row.iter().cloned());
                new_result.push(combined);
            }
        }
        result = new_result;
    }

    result
}
