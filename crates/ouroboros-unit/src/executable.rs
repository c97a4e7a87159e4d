//! Executable tests and their results
//!
//! An [`ExecutableTest`] is one concrete, argument-bound test produced by
//! expansion. It is shared as `Arc` between the scheduler and the tests that
//! depend on it; its state moves forward only, and its [`TestResult`] is set
//! exactly once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

use crate::error::TestError;
use crate::invoker::TestInvoker;
use crate::metadata::TestMetadata;
use crate::value::ArgValue;

/// Lifecycle state of an executable test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestState {
    NotStarted,
    WaitingForDependencies,
    Queued,
    Running,
    Passed,
    Failed,
    Skipped,
    Timeout,
    Cancelled,
}

impl TestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestState::Passed
                | TestState::Failed
                | TestState::Skipped
                | TestState::Timeout
                | TestState::Cancelled
        )
    }
}

/// Terminal test status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestStatus {
    /// Test passed
    Passed,
    /// Test failed (assertion, hook, setup or dependency failure)
    Failed,
    /// Test was skipped
    Skipped,
    /// Test exceeded its timeout
    Timeout,
    /// The run was cancelled before the test finished
    Cancelled,
}

impl TestStatus {
    /// Status a failure cause maps to
    pub fn from_error(error: &TestError) -> Self {
        match error {
            TestError::Timeout(_) => TestStatus::Timeout,
            TestError::Cancelled => TestStatus::Cancelled,
            TestError::Skipped(_) => TestStatus::Skipped,
            _ => TestStatus::Failed,
        }
    }

    /// Failed and timed-out tests count against the run
    pub fn is_failure(&self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Timeout)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "PASSED"),
            TestStatus::Failed => write!(f, "FAILED"),
            TestStatus::Skipped => write!(f, "SKIPPED"),
            TestStatus::Timeout => write!(f, "TIMEOUT"),
            TestStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl From<TestStatus> for TestState {
    fn from(status: TestStatus) -> Self {
        match status {
            TestStatus::Passed => TestState::Passed,
            TestStatus::Failed => TestState::Failed,
            TestStatus::Skipped => TestState::Skipped,
            TestStatus::Timeout => TestState::Timeout,
            TestStatus::Cancelled => TestState::Cancelled,
        }
    }
}

/// Terminal outcome of one test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub display_name: String,
    pub class_name: String,
    pub status: TestStatus,
    pub error: Option<TestError>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    /// Attempts made (0 when the body never ran)
    pub attempts: u32,
}

impl TestResult {
    fn base(test: &ExecutableTest, status: TestStatus, error: Option<TestError>) -> Self {
        let now = Utc::now();
        Self {
            test_id: test.id.clone(),
            display_name: test.display_name.clone(),
            class_name: test.metadata.class.name.clone(),
            status,
            error,
            started_at: now,
            ended_at: now,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
            attempts: 0,
        }
    }

    /// Skipped without running: zero duration
    pub fn skipped(test: &ExecutableTest, reason: impl Into<String>) -> Self {
        Self::base(test, TestStatus::Skipped, Some(TestError::Skipped(reason.into())))
    }

    /// Ended before any attempt ran (dependency, expansion or setup failure, cancellation)
    pub fn not_run(test: &ExecutableTest, error: TestError) -> Self {
        let status = TestStatus::from_error(&error);
        Self::base(test, status, Some(error))
    }

    /// Result of running the test
    pub fn finished(
        test: &ExecutableTest,
        status: TestStatus,
        error: Option<TestError>,
        started_at: DateTime<Utc>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        let mut result = Self::base(test, status, error);
        result.started_at = started_at;
        result.ended_at = Utc::now();
        result.duration = duration;
        result.attempts = attempts;
        result
    }

    /// Attach captured output
    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn is_passed(&self) -> bool {
        self.status == TestStatus::Passed
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

#[derive(Debug)]
struct Timeline {
    state: TestState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// One concrete, fully parameterized test
pub struct ExecutableTest {
    id: String,
    display_name: String,
    metadata: Arc<TestMetadata>,
    class_args: Vec<ArgValue>,
    args: Vec<ArgValue>,
    properties: Arc<Vec<(String, ArgValue)>>,
    invoker: Option<Arc<dyn TestInvoker>>,
    dependencies: OnceLock<Vec<Weak<ExecutableTest>>>,
    timeline: Mutex<Timeline>,
    result: OnceLock<TestResult>,
    done: watch::Sender<bool>,
}

impl ExecutableTest {
    pub(crate) fn new(
        id: String,
        display_name: String,
        metadata: Arc<TestMetadata>,
        class_args: Vec<ArgValue>,
        args: Vec<ArgValue>,
        properties: Vec<(String, ArgValue)>,
        invoker: Option<Arc<dyn TestInvoker>>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            display_name,
            metadata,
            class_args,
            args,
            properties: Arc::new(properties),
            invoker,
            dependencies: OnceLock::new(),
            timeline: Mutex::new(Timeline {
                state: TestState::NotStarted,
                started_at: None,
                ended_at: None,
            }),
            result: OnceLock::new(),
            done,
        }
    }

    /// Placeholder for a test signature whose expansion failed
    pub(crate) fn expansion_failure(id: String, metadata: Arc<TestMetadata>) -> Self {
        let display_name = metadata.method_name.clone();
        Self::new(id, display_name, metadata, Vec::new(), Vec::new(), Vec::new(), None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn metadata(&self) -> &Arc<TestMetadata> {
        &self.metadata
    }

    pub fn class_args(&self) -> &[ArgValue] {
        &self.class_args
    }

    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }

    pub fn properties(&self) -> &Arc<Vec<(String, ArgValue)>> {
        &self.properties
    }

    pub fn invoker(&self) -> Option<&Arc<dyn TestInvoker>> {
        self.invoker.as_ref()
    }

    pub fn priority(&self) -> i32 {
        self.metadata.priority
    }

    /// Set the resolved prerequisites; only the first call takes effect
    pub(crate) fn set_dependencies(&self, deps: &[Arc<ExecutableTest>]) {
        let weak = deps.iter().map(Arc::downgrade).collect();
        if self.dependencies.set(weak).is_err() {
            warn!(test_id = %self.id, "dependencies already resolved");
        }
    }

    /// Resolved prerequisites
    pub fn dependencies(&self) -> Vec<Arc<ExecutableTest>> {
        self.dependencies
            .get()
            .map(|deps| deps.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self) -> bool {
        self.dependencies.get().is_some_and(|deps| !deps.is_empty())
    }

    /// True once every prerequisite has reached a terminal state
    pub fn dependencies_terminal(&self) -> bool {
        self.dependencies().iter().all(|d| d.is_terminal())
    }

    pub fn state(&self) -> TestState {
        self.timeline.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.result.get().is_some()
    }

    /// Move to a non-terminal state; ignored once the test is terminal
    pub(crate) fn set_state(&self, state: TestState) {
        let mut timeline = self.timeline.lock();
        if timeline.state.is_terminal() {
            return;
        }
        if state == TestState::Running && timeline.started_at.is_none() {
            timeline.started_at = Some(Utc::now());
        }
        timeline.state = state;
    }

    /// Record the terminal result. Returns false if one was already set.
    pub(crate) fn complete(&self, result: TestResult) -> bool {
        let state = TestState::from(result.status);
        if self.result.set(result).is_err() {
            warn!(test_id = %self.id, "test already has a result");
            return false;
        }
        {
            let mut timeline = self.timeline.lock();
            timeline.state = state;
            timeline.ended_at = Some(Utc::now());
        }
        self.done.send_replace(true);
        true
    }

    pub fn result(&self) -> Option<&TestResult> {
        self.result.get()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.timeline.lock().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.timeline.lock().ended_at
    }

    /// Resolves once the test has a result
    pub async fn wait_terminal(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for ExecutableTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableTest")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
