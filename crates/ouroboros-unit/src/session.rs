//! One test run, end to end
//!
//! Sources → filter → expansion → dependency resolution → scope
//! registration → grouping → scheduling. Every component with run state
//! (orchestrator, scheduler, semaphores) is built fresh inside [`TestSession::run`].

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dependency::resolve_dependencies;
use crate::error::{EngineError, Result, TestError};
use crate::executable::{ExecutableTest, TestResult};
use crate::expander::{ExpansionLimits, TestExpander};
use crate::grouper::group_tests;
use crate::hooks::{HookInvoker, HookRegistry};
use crate::invoker::InvokerRegistry;
use crate::lifecycle::LifecycleOrchestrator;
use crate::metadata::{InvokerBinding, TestMetadata};
use crate::monitor::{NeverStrained, ResourceMonitor};
use crate::reporter::{ResultSink, RunSummary, TestReport};
use crate::scheduler::{SchedulerOptions, TestScheduler};
use crate::source::{collect_metadata, DataSourceRegistry, DataSourceResolver, MetadataSource};

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    /// One result per expanded test, in expansion order
    pub results: Vec<TestResult>,
    pub summary: RunSummary,
}

impl RunOutcome {
    pub fn result(&self, test_id: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.test_id == test_id)
    }

    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code()
    }

    pub fn report(&self, suite_name: impl Into<String>) -> TestReport {
        TestReport::new(suite_name, self.results.clone(), self.summary.clone())
    }
}

/// Builder for a test run
pub struct TestSession {
    config: EngineConfig,
    sources: Vec<Arc<dyn MetadataSource>>,
    data: Arc<dyn DataSourceResolver>,
    invokers: Option<Arc<InvokerRegistry>>,
    hooks: Arc<HookRegistry>,
    hook_invoker: Option<Arc<dyn HookInvoker>>,
    monitor: Arc<dyn ResourceMonitor>,
    sink: Option<Arc<dyn ResultSink>>,
    token: CancellationToken,
}

impl Default for TestSession {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl TestSession {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            data: Arc::new(DataSourceRegistry::new()),
            invokers: None,
            hooks: Arc::new(HookRegistry::new()),
            hook_invoker: None,
            monitor: Arc::new(NeverStrained),
            sink: None,
            token: CancellationToken::new(),
        }
    }

    pub fn with_source(mut self, source: impl MetadataSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    pub fn with_data_sources(mut self, resolver: impl DataSourceResolver + 'static) -> Self {
        self.data = Arc::new(resolver);
        self
    }

    pub fn with_invokers(mut self, invokers: InvokerRegistry) -> Self {
        self.invokers = Some(Arc::new(invokers));
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Run declared hooks through an external invoker instead of the registry's closures
    pub fn with_hook_invoker(mut self, invoker: Arc<dyn HookInvoker>) -> Self {
        self.hook_invoker = Some(invoker);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use `token` as the process-wide cancellation source
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Cancelling this token aborts the run; remaining tests end Cancelled
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run every discovered test to a terminal result.
    ///
    /// Test failures are reported in the outcome. Only framework errors
    /// (missing collaborators, bad configuration, broken invariants) are
    /// returned as `Err`.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.config.validate()?;
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| EngineError::NotInitialized("no result sink registered".to_string()))?;
        if self.sources.is_empty() {
            return Err(EngineError::NotInitialized("no metadata source registered".to_string()));
        }

        let run_id = Uuid::now_v7();
        let clock = Instant::now();
        info!(%run_id, sources = self.sources.len(), "starting test run");

        let discovered = collect_metadata(&self.sources).await?;
        let selected = self.config.filter.select(discovered)?;
        let invokers = self.invoker_registry(&selected)?;

        let tests = self.expand(selected, invokers).await;
        let report = resolve_dependencies(&tests);
        if !report.is_clean() {
            warn!(
                unresolved = report.unresolved.len(),
                circular = report.circular.len(),
                "dependency resolution failed some tests"
            );
        }

        // Tests that already failed never touch a scope
        for test in tests.iter() {
            if let Some(result) = test.result() {
                sink.report(test, result).await;
            }
        }

        let run_token = self.token.child_token();
        let orchestrator = Arc::new(match &self.hook_invoker {
            Some(invoker) => LifecycleOrchestrator::with_invoker(self.hooks.clone(), invoker.clone(), run_token.clone()),
            None => LifecycleOrchestrator::new(self.hooks.clone(), run_token.clone()),
        });
        let runnable: Vec<Arc<ExecutableTest>> = tests.iter().filter(|t| !t.is_terminal()).cloned().collect();
        for test in &runnable {
            orchestrator.register_test(&test.metadata().class)?;
        }
        debug!(runnable = runnable.len(), total = tests.len(), "registered tests");

        let scheduler = Arc::new(TestScheduler::new(
            orchestrator,
            self.monitor.clone(),
            sink.clone(),
            SchedulerOptions::from(&self.config),
            self.config.default_timeout(),
            run_token,
        ));
        scheduler.run(group_tests(&runnable)).await?;

        let results: Vec<TestResult> = tests
            .iter()
            .map(|test| {
                test.result().cloned().unwrap_or_else(|| {
                    TestResult::not_run(test, TestError::Other("test never reached a terminal state".to_string()))
                })
            })
            .collect();
        let summary = RunSummary::from_results(&results, clock.elapsed());
        sink.on_run_finished(&summary).await;
        info!(
            %run_id,
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            timed_out = summary.timed_out,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "test run finished"
        );

        Ok(RunOutcome {
            run_id,
            results,
            summary,
        })
    }

    /// Named invokers need a registry; direct ones do not
    fn invoker_registry(&self, metadata: &[TestMetadata]) -> Result<Arc<InvokerRegistry>> {
        match &self.invokers {
            Some(registry) => Ok(registry.clone()),
            None if metadata.iter().any(|m| matches!(m.invoker, InvokerBinding::Named(_))) => Err(
                EngineError::NotInitialized("tests use named invokers but no invoker registry is registered".to_string()),
            ),
            None => Ok(Arc::new(InvokerRegistry::new())),
        }
    }

    /// Expand every signature; a failed expansion becomes one failed placeholder test
    async fn expand(&self, metadata: Vec<TestMetadata>, invokers: Arc<InvokerRegistry>) -> Vec<Arc<ExecutableTest>> {
        let mut expander = TestExpander::new(self.data.clone(), invokers, ExpansionLimits::from(&self.config));
        let mut tests = Vec::new();
        for meta in metadata {
            let meta = Arc::new(meta);
            match expander.expand(meta.clone()).await {
                Ok(expanded) => tests.extend(expanded),
                Err(e) => {
                    warn!(test = %meta.id, error = %e, "expansion failed");
                    tests.push(expander.expansion_failure(meta, e));
                }
            }
        }
        tests
    }
}
