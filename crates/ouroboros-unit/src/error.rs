//! Error types for the test engine
//!
//! Two families live here:
//! - [`TestError`]: why a single test did not pass. These are recorded on the
//!   test's result and never abort the run.
//! - [`EngineError`]: the framework itself is misconfigured or an internal
//!   invariant broke. These propagate out of the run.
//!
//! [`Failures`] collects zero or more [`TestError`]s (teardown, disposal,
//! scope cleanup) and decides how they surface.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine-level operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Outcome of a single step of a test: success or the reason it failed
pub type TestOutcome = std::result::Result<(), TestError>;

/// Errors produced while expanding test metadata into concrete tests
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExpansionError {
    #[error("Failed to resolve data source '{source_name}': {message}")]
    DataSource { source_name: String, message: String },

    #[error("Cartesian product exceeded maximum recursion depth of {limit}")]
    MaxDepthExceeded { limit: usize },

    #[error("Cartesian product exceeded maximum combinations limit of {limit}")]
    TooManyCombinations { limit: usize },

    #[error("No invoker registered under '{0}'")]
    UnknownInvoker(String),
}

/// Per-test failure causes
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestError {
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Test panicked: {0}")]
    Panicked(String),

    #[error("Test exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("Test run was cancelled")]
    Cancelled,

    #[error("Skipped: {0}")]
    Skipped(String),

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Expansion failed: {0}")]
    Expansion(#[from] ExpansionError),

    #[error("Unresolved dependency: {0}")]
    UnresolvedDependency(String),

    #[error("Circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("Hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("One-time setup for {scope} failed: {cause}")]
    SetupFailed { scope: String, cause: Box<TestError> },

    #[error("Failed to create test instance: {0}")]
    Instance(String),

    #[error("Failed to dispose test instance: {0}")]
    Dispose(String),

    #[error("{}", aggregate_message(.0))]
    Aggregate(Vec<TestError>),

    #[error("{0}")]
    Other(String),
}

fn aggregate_message(causes: &[TestError]) -> String {
    let rendered: Vec<String> = causes.iter().map(|c| c.to_string()).collect();
    format!("{} errors occurred: [{}]", causes.len(), rendered.join("; "))
}

impl TestError {
    /// Shorthand for an assertion failure
    pub fn assertion(message: impl Into<String>) -> Self {
        TestError::Assertion(message.into())
    }

    /// Shorthand for a hook failure
    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        TestError::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error is a per-test timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, TestError::Timeout(_))
    }

    /// Returns true if this error is a run-level cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TestError::Cancelled)
    }

    /// Returns true if the test asked to be skipped at runtime
    pub fn is_skip(&self) -> bool {
        matches!(self, TestError::Skipped(_))
    }

    /// Returns true if another attempt could change the outcome
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TestError::Cancelled
                | TestError::Skipped(_)
                | TestError::SetupFailed { .. }
                | TestError::Expansion(_)
                | TestError::UnresolvedDependency(_)
                | TestError::CircularDependency(_)
        )
    }

    /// Individual causes (a single error is its own only cause)
    pub fn causes(&self) -> &[TestError] {
        match self {
            TestError::Aggregate(causes) => causes,
            other => std::slice::from_ref(other),
        }
    }
}

impl From<anyhow::Error> for TestError {
    fn from(err: anyhow::Error) -> Self {
        TestError::Other(format!("{:#}", err))
    }
}

/// Fatal framework errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Remaining-test counter for {scope} would go negative")]
    CounterUnderflow { scope: String },

    #[error("Scope {0} was never registered")]
    ScopeNotRegistered(String),

    #[error("Scope {0} has already been torn down")]
    ScopeClosed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Task join error: {0}")]
    Join(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Join(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

/// Zero or more failure causes collected while tearing something down
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Failures {
    causes: Vec<TestError>,
}

impl Failures {
    pub fn new() -> Self {
        Self { causes: Vec::new() }
    }

    /// Record a failure cause
    pub fn push(&mut self, error: TestError) {
        self.causes.push(error);
    }

    /// Record the error side of a result, if any
    pub fn record(&mut self, result: TestOutcome) {
        if let Err(e) = result {
            self.causes.push(e);
        }
    }

    /// Append every cause from another collection
    pub fn extend(&mut self, other: Failures) {
        self.causes.extend(other.causes);
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestError> {
        self.causes.iter()
    }

    /// Collapse into a single outcome.
    ///
    /// No causes is success, a single cause surfaces unchanged, several are
    /// wrapped in [`TestError::Aggregate`] in the order they were recorded.
    pub fn into_result(mut self) -> TestOutcome {
        match self.causes.len() {
            0 => Ok(()),
            1 => Err(self.causes.remove(0)),
            _ => Err(TestError::Aggregate(self.causes)),
        }
    }
}

impl From<Vec<TestError>> for Failures {
    fn from(causes: Vec<TestError>) -> Self {
        Self { causes }
    }
}
