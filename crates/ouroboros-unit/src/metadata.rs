//! Test metadata - the immutable description of a discovered test
//!
//! A [`TestMetadata`] describes one test signature before expansion: which
//! class and method it belongs to, where its arguments come from, what it
//! depends on and how it may be scheduled. It is built once by a metadata
//! source and never mutated afterwards.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ExpansionError;
use crate::invoker::{InvokerRegistry, TestInvoker};
use crate::retry::RetryPolicy;
use crate::value::ArgValue;

/// Default assembly name for classes that do not declare one
pub const DEFAULT_ASSEMBLY: &str = "default";

/// A test class: its name, the assembly it lives in, and its base classes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassInfo {
    pub name: String,
    pub assembly: String,
    /// Base classes, nearest first
    pub base_classes: Vec<String>,
}

impl ClassInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            assembly: DEFAULT_ASSEMBLY.to_string(),
            base_classes: Vec::new(),
        }
    }

    /// Set the assembly
    pub fn in_assembly(mut self, assembly: impl Into<String>) -> Self {
        self.assembly = assembly.into();
        self
    }

    /// Append a base class (call nearest first)
    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.base_classes.push(base.into());
        self
    }

    /// True if this class is `name` or derives from it
    pub fn is_or_derives(&self, name: &str) -> bool {
        self.name == name || self.base_classes.iter().any(|b| b == name)
    }
}

/// Where a row of arguments comes from
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    /// Rows given inline
    Inline(Vec<Vec<ArgValue>>),
    /// Rows produced by the data source resolver under this name
    Named(String),
    /// Cartesian product of inner sources; each row is the concatenation of
    /// one row from every inner source
    Product(Vec<DataSource>),
}

impl DataSource {
    /// Inline source with one single-value row per item
    pub fn values<T: Into<ArgValue>>(values: impl IntoIterator<Item = T>) -> Self {
        DataSource::Inline(values.into_iter().map(|v| vec![v.into()]).collect())
    }

    /// Inline source from whole rows
    pub fn rows(rows: Vec<Vec<ArgValue>>) -> Self {
        DataSource::Inline(rows)
    }

    pub fn named(name: impl Into<String>) -> Self {
        DataSource::Named(name.into())
    }

    /// Short label used in diagnostics
    pub fn label(&self) -> String {
        match self {
            DataSource::Inline(rows) => format!("inline({} rows)", rows.len()),
            DataSource::Named(name) => name.clone(),
            DataSource::Product(inner) => format!(
                "product({})",
                inner.iter().map(DataSource::label).collect::<Vec<_>>().join(" x ")
            ),
        }
    }
}

/// A property injected into the test instance from a data source
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySource {
    pub name: String,
    pub source: DataSource,
}

/// Declared dependency on other tests.
///
/// An unset class means "the dependent's own class". An unset method means
/// every test of the class. Parameter types pick one overload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyMatcher {
    pub class: Option<String>,
    pub method: Option<String>,
    pub parameter_types: Option<Vec<String>>,
}

impl DependencyMatcher {
    /// Depend on a method of the same class
    pub fn method(method: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            ..Default::default()
        }
    }

    /// Depend on every test of a class
    pub fn class(class: impl Into<String>) -> Self {
        Self {
            class: Some(class.into()),
            ..Default::default()
        }
    }

    /// Depend on a method of another class
    pub fn method_in(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: Some(class.into()),
            method: Some(method.into()),
            parameter_types: None,
        }
    }

    /// Restrict to the overload with these parameter types
    pub fn with_parameter_types(mut self, types: Vec<String>) -> Self {
        self.parameter_types = Some(types);
        self
    }

    /// Does `candidate` satisfy this dependency of `dependent`?
    pub fn matches(&self, candidate: &TestMetadata, dependent: &TestMetadata) -> bool {
        let class = self.class.as_deref().unwrap_or(&dependent.class.name);
        if !candidate.class.is_or_derives(class) {
            return false;
        }
        if let Some(method) = &self.method {
            if &candidate.method_name != method {
                return false;
            }
        }
        if let Some(types) = &self.parameter_types {
            if &candidate.parameter_types != types {
                return false;
            }
        }
        true
    }

    /// Human-readable form relative to the dependent test
    pub fn describe(&self, dependent: &TestMetadata) -> String {
        let class = self.class.as_deref().unwrap_or(&dependent.class.name);
        let mut out = match &self.method {
            Some(method) => format!("{}.{}", class, method),
            None => format!("{}.*", class),
        };
        if let Some(types) = &self.parameter_types {
            out.push_str(&format!("({})", types.join(", ")));
        }
        out
    }
}

/// A named concurrency limiter shared by every test that declares it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelLimit {
    pub name: String,
    pub limit: usize,
}

/// How a test invoker is obtained.
///
/// Resolved once per test signature at expansion time, never per invocation.
#[derive(Clone)]
pub enum InvokerBinding {
    /// Invoker registered directly with the metadata
    Direct(Arc<dyn TestInvoker>),
    /// Invoker looked up by name in the [`InvokerRegistry`]
    Named(String),
}

impl InvokerBinding {
    pub fn resolve(&self, registry: &InvokerRegistry) -> Result<Arc<dyn TestInvoker>, ExpansionError> {
        match self {
            InvokerBinding::Direct(invoker) => Ok(invoker.clone()),
            InvokerBinding::Named(name) => registry
                .get(name)
                .ok_or_else(|| ExpansionError::UnknownInvoker(name.clone())),
        }
    }
}

impl std::fmt::Debug for InvokerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokerBinding::Direct(_) => write!(f, "Direct(..)"),
            InvokerBinding::Named(name) => write!(f, "Named({:?})", name),
        }
    }
}

/// Metadata for a test method
#[derive(Debug, Clone)]
pub struct TestMetadata {
    /// Stable id, `Class.method` unless overridden
    pub id: String,
    pub class: ClassInfo,
    pub method_name: String,
    /// Method parameter types, used to tell overloads apart
    pub parameter_types: Vec<String>,
    /// Sources for class constructor arguments
    pub class_data_sources: Vec<DataSource>,
    /// Sources for method arguments
    pub data_sources: Vec<DataSource>,
    /// Sources for injected properties, in declaration order
    pub property_sources: Vec<PropertySource>,
    pub dependencies: Vec<DependencyMatcher>,
    /// `None`: runs in parallel. `Some([])`: globally serial.
    /// `Some(keys)`: never concurrent with tests sharing a key.
    pub not_in_parallel: Option<Vec<String>>,
    pub parallel_limit: Option<ParallelLimit>,
    /// Higher runs first
    pub priority: i32,
    /// How often a failed test is re-attempted
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub skip_reason: Option<String>,
    pub categories: Vec<String>,
    pub invoker: InvokerBinding,
}

impl TestMetadata {
    /// Create metadata for `method` on `class`, invoked through `invoker`
    pub fn new(class: ClassInfo, method: impl Into<String>, invoker: InvokerBinding) -> Self {
        let method_name = method.into();
        Self {
            id: format!("{}.{}", class.name, method_name),
            class,
            method_name,
            parameter_types: Vec::new(),
            class_data_sources: Vec::new(),
            data_sources: Vec::new(),
            property_sources: Vec::new(),
            dependencies: Vec::new(),
            not_in_parallel: None,
            parallel_limit: None,
            priority: 0,
            retry: RetryPolicy::no_retry(),
            timeout: None,
            skip_reason: None,
            categories: Vec::new(),
            invoker,
        }
    }

    /// Override the id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set parameter types; the id gains the signature so overloads stay distinct
    pub fn with_parameter_types(mut self, types: Vec<String>) -> Self {
        self.id = format!("{}.{}({})", self.class.name, self.method_name, types.join(","));
        self.parameter_types = types;
        self
    }

    /// Add a class constructor data source
    pub fn with_class_data(mut self, source: DataSource) -> Self {
        self.class_data_sources.push(source);
        self
    }

    /// Add a method argument data source
    pub fn with_data(mut self, source: DataSource) -> Self {
        self.data_sources.push(source);
        self
    }

    /// Add an injected property source
    pub fn with_property(mut self, name: impl Into<String>, source: DataSource) -> Self {
        self.property_sources.push(PropertySource {
            name: name.into(),
            source,
        });
        self
    }

    pub fn depends_on(mut self, matcher: DependencyMatcher) -> Self {
        self.dependencies.push(matcher);
        self
    }

    /// Never run concurrently with any test sharing one of `keys`.
    /// An empty list makes the test globally serial.
    pub fn not_in_parallel<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.not_in_parallel = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_parallel_limit(mut self, name: impl Into<String>, limit: usize) -> Self {
        self.parallel_limit = Some(ParallelLimit {
            name: name.into(),
            limit,
        });
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Re-attempt up to `retry_count` more times, without delay
    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry = RetryPolicy::immediate(retry_count);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set skip reason
    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    pub fn with_categories<S: Into<String>>(mut self, categories: impl IntoIterator<Item = S>) -> Self {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    /// Check if test should be skipped
    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }

    /// Check if test has a specific category
    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }
}
