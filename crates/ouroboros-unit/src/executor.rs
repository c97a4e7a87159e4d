//! Single-test execution
//!
//! Drives one registered [`ExecutableTest`] to a terminal result:
//! one-time scope setup, then up to `max_retries + 1` attempts of
//! (instance -> properties -> setup hooks -> body -> teardown hooks ->
//! dispose), then completion towards the orchestrator, which may tear
//! scopes down. Teardown failures never mask the primary failure but do fail
//! an otherwise passing test.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attempt::{catch_panic, AttemptScope};
use crate::capture::OutputCapture;
use crate::context::TestContext;
use crate::error::{Failures, Result, TestError};
use crate::executable::{ExecutableTest, TestResult, TestState, TestStatus};
use crate::lifecycle::LifecycleOrchestrator;
use crate::scope::ScopeChain;

/// What one attempt produced
#[derive(Debug, Default)]
struct AttemptReport {
    /// Failure of instance creation, setup hooks or the body
    primary: Option<TestError>,
    /// Teardown hook and dispose failures
    teardown: Failures,
}

impl AttemptReport {
    fn failed(&self) -> bool {
        self.primary.is_some() || !self.teardown.is_empty()
    }
}

/// Runs single tests
pub struct SingleTestExecutor {
    orchestrator: Arc<LifecycleOrchestrator>,
    run_token: CancellationToken,
    default_timeout: Option<Duration>,
}

impl SingleTestExecutor {
    pub fn new(
        orchestrator: Arc<LifecycleOrchestrator>,
        run_token: CancellationToken,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            orchestrator,
            run_token,
            default_timeout,
        }
    }

    /// Run a registered test to its terminal result and record it on the test
    pub async fn execute(&self, test: &ExecutableTest, chain: &ScopeChain) -> Result<TestResult> {
        let result = self.run_to_result(test, chain).await?;
        debug!(test_id = %test.id(), status = %result.status, "test finished");
        test.complete(result.clone());
        Ok(result)
    }

    async fn run_to_result(&self, test: &ExecutableTest, chain: &ScopeChain) -> Result<TestResult> {
        let meta = test.metadata();

        if let Some(reason) = &meta.skip_reason {
            let cleanup = self.orchestrator.complete_test(chain).await?;
            let (_, error) = settle(Some(TestError::Skipped(reason.clone())), cleanup);
            let mut result = TestResult::skipped(test, reason.clone());
            result.error = error;
            return Ok(result);
        }

        if self.run_token.is_cancelled() {
            let cleanup = self.orchestrator.complete_test(chain).await?;
            let (status, error) = settle(Some(TestError::Cancelled), cleanup);
            let mut result = TestResult::not_run(test, TestError::Cancelled);
            result.status = status;
            result.error = error;
            return Ok(result);
        }

        test.set_state(TestState::Running);
        let started_at = Utc::now();
        let clock = Instant::now();

        let (report, attempts, output) = match self.orchestrator.ensure_setup(chain).await? {
            Err(setup_error) => (
                AttemptReport {
                    primary: Some(setup_error),
                    teardown: Failures::new(),
                },
                0,
                OutputCapture::new(),
            ),
            Ok(()) => self.run_attempts(test, chain).await,
        };

        let mut cleanup = report.teardown;
        cleanup.extend(self.orchestrator.complete_test(chain).await?);
        let (status, error) = settle(report.primary, cleanup);

        Ok(
            TestResult::finished(test, status, error, started_at, clock.elapsed(), attempts)
                .with_output(output.stdout(), output.stderr()),
        )
    }

    /// Attempt loop; only the last attempt's report and output survive
    async fn run_attempts(&self, test: &ExecutableTest, chain: &ScopeChain) -> (AttemptReport, u32, OutputCapture) {
        let policy = &test.metadata().retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let capture = OutputCapture::new();
            let report = capture
                .scope(self.run_attempt(test, chain, attempt, &capture))
                .await;

            let retry = report.failed()
                && !self.run_token.is_cancelled()
                && policy.should_retry(attempt, report.primary.as_ref());
            if !retry {
                return (report, attempt, capture);
            }

            warn!(
                test_id = %test.id(),
                attempt,
                max_attempts = policy.max_attempts(),
                error = %report.primary.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "teardown failed".to_string()),
                "attempt failed, retrying"
            );
            let delay = policy.delay_for_retry(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.run_token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        test: &ExecutableTest,
        chain: &ScopeChain,
        attempt: u32,
        capture: &OutputCapture,
    ) -> AttemptReport {
        let meta = test.metadata();
        let invoker = match test.invoker() {
            Some(invoker) => invoker.clone(),
            None => {
                return AttemptReport {
                    primary: Some(TestError::Instance("no invoker bound to test".to_string())),
                    teardown: Failures::new(),
                }
            }
        };

        let mut scope = AttemptScope::new(&self.run_token, meta.timeout.or(self.default_timeout));
        let ctx = TestContext::new(
            test.id(),
            test.display_name(),
            meta.class.name.clone(),
            attempt,
            test.properties().clone(),
            scope.token().clone(),
            capture.clone(),
        );

        let mut instance = match catch_panic(invoker.create_instance(test.class_args())).await {
            Ok(instance) => instance,
            Err(e) => {
                return AttemptReport {
                    primary: Some(as_instance_error(e)),
                    teardown: Failures::new(),
                }
            }
        };

        let mut primary = None;
        for (name, value) in test.properties().iter() {
            if let Err(e) = instance.set_property(name, value.clone()) {
                primary = Some(TestError::Instance(format!("property '{}': {}", name, e)));
                break;
            }
        }

        if primary.is_none() {
            if let Err(e) = self.orchestrator.run_method_setup(chain, &mut instance, test.id()).await {
                primary = Some(e);
            }
        }

        if primary.is_none() {
            let body = invoker.invoke(&mut instance, test.args(), &ctx);
            if let Err(e) = scope.run(body).await {
                primary = Some(e);
            }
        }

        let mut teardown = self
            .orchestrator
            .run_method_teardown(chain, &mut instance, test.id())
            .await;
        if let Err(e) = catch_panic(instance.dispose()).await {
            teardown.push(match e {
                TestError::Dispose(_) => e,
                other => TestError::Dispose(other.to_string()),
            });
        }

        AttemptReport { primary, teardown }
    }
}

fn as_instance_error(error: TestError) -> TestError {
    match error {
        TestError::Instance(_) | TestError::Skipped(_) | TestError::Cancelled => error,
        other => TestError::Instance(other.to_string()),
    }
}

/// Status and reported error of a primary outcome followed by cleanup.
///
/// The primary failure decides the status; cleanup failures only turn a
/// pass into a failure. All causes are kept, primary first.
fn settle(primary: Option<TestError>, cleanup: Failures) -> (TestStatus, Option<TestError>) {
    let status = match &primary {
        Some(error) => TestStatus::from_error(error),
        None if cleanup.is_empty() => TestStatus::Passed,
        None => TestStatus::Failed,
    };

    let mut all = Failures::new();
    if let Some(error) = primary {
        all.push(error);
    }
    all.extend(cleanup);
    (status, all.into_result().err())
}
