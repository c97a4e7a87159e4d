//! Admission-controlled scheduling of grouped tests
//!
//! The three lanes produced by the grouper run side by side:
//!
//! - **parallel**: every test spawned at once, gated only by admission
//! - **serial**: one test at a time, first eligible test in priority order
//! - **keyed**: rounds of one representative per key group, never two
//!   tests with overlapping keys in the same round
//!
//! Every test first waits for its dependencies to become terminal, then
//! passes admission (global cap, assembly cap, named limiter, then strain
//! backoff), then runs through the [`SingleTestExecutor`].

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executable::{ExecutableTest, TestState};
use crate::executor::SingleTestExecutor;
use crate::grouper::{GroupedTests, KeyedGroup};
use crate::lifecycle::LifecycleOrchestrator;
use crate::monitor::ResourceMonitor;
use crate::reporter::ResultSink;

/// Scheduler knobs
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    /// Global cap on concurrently executing tests (0 = unbounded)
    pub max_parallelism: usize,
    /// Per-assembly caps
    pub assembly_limits: HashMap<String, usize>,
    /// Pause between admission checks while strained
    pub strain_backoff: Duration,
    /// Cancel the rest of the run after the first failure
    pub fail_fast: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SchedulerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_parallelism: config.max_parallelism,
            assembly_limits: config.assembly_limits.clone(),
            strain_backoff: config.strain_backoff(),
            fail_fast: config.fail_fast,
        }
    }
}

/// Permits held while a test executes
struct Admission {
    _global: Option<OwnedSemaphorePermit>,
    _assembly: Option<OwnedSemaphorePermit>,
    _limiter: Option<OwnedSemaphorePermit>,
}

/// Drives grouped tests to completion
pub struct TestScheduler {
    executor: SingleTestExecutor,
    orchestrator: Arc<LifecycleOrchestrator>,
    monitor: Arc<dyn ResourceMonitor>,
    sink: Arc<dyn ResultSink>,
    options: SchedulerOptions,
    run_token: CancellationToken,
    global: Option<Arc<Semaphore>>,
    assemblies: DashMap<String, Arc<Semaphore>>,
    limiters: DashMap<String, Arc<Semaphore>>,
    executing: AtomicUsize,
    completions: watch::Sender<u64>,
    fatal: Mutex<Option<EngineError>>,
}

impl TestScheduler {
    pub fn new(
        orchestrator: Arc<LifecycleOrchestrator>,
        monitor: Arc<dyn ResourceMonitor>,
        sink: Arc<dyn ResultSink>,
        options: SchedulerOptions,
        default_timeout: Option<Duration>,
        run_token: CancellationToken,
    ) -> Self {
        let executor = SingleTestExecutor::new(orchestrator.clone(), run_token.clone(), default_timeout);
        let global = (options.max_parallelism > 0).then(|| Arc::new(Semaphore::new(options.max_parallelism)));
        let (completions, _) = watch::channel(0);
        Self {
            executor,
            orchestrator,
            monitor,
            sink,
            options,
            run_token,
            global,
            assemblies: DashMap::new(),
            limiters: DashMap::new(),
            executing: AtomicUsize::new(0),
            completions,
            fatal: Mutex::new(None),
        }
    }

    pub fn run_token(&self) -> &CancellationToken {
        &self.run_token
    }

    /// Tests currently past admission
    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    /// Run every lane to completion.
    ///
    /// Test failures end up in the results; only a framework error is
    /// returned, after the remaining tests have been cancelled and drained.
    pub async fn run(self: &Arc<Self>, grouped: GroupedTests) -> Result<()> {
        info!(
            parallel = grouped.parallel.len(),
            serial = grouped.serial.len(),
            keyed_groups = grouped.keyed.len(),
            "scheduling tests"
        );

        tokio::join!(
            self.run_parallel(grouped.parallel),
            self.run_serial(grouped.serial),
            self.run_keyed(grouped.keyed),
        );

        match self.fatal.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_parallel(self: &Arc<Self>, tests: Vec<Arc<ExecutableTest>>) {
        let handles: Vec<_> = tests.into_iter().map(|test| self.spawn_test(test)).collect();
        self.join(handles).await;
    }

    async fn run_serial(self: &Arc<Self>, mut queue: Vec<Arc<ExecutableTest>>) {
        let mut changes = self.completions.subscribe();
        while !queue.is_empty() {
            changes.borrow_and_update();
            match queue.iter().position(|t| t.dependencies_terminal()) {
                Some(index) => {
                    let test = queue.remove(index);
                    trace!(test_id = %test.id(), "serial lane picked test");
                    self.run_one(test).await;
                }
                None => {
                    if !self.wait_for_completion(&mut changes).await {
                        return;
                    }
                }
            }
        }
    }

    async fn run_keyed(self: &Arc<Self>, mut groups: Vec<KeyedGroup>) {
        let mut changes = self.completions.subscribe();
        let mut round_number = 0usize;
        loop {
            groups.retain(|g| !g.tests.is_empty());
            if groups.is_empty() {
                return;
            }
            changes.borrow_and_update();
            groups.sort_by_key(|g| std::cmp::Reverse(g.top_priority()));

            let mut claimed: BTreeSet<String> = BTreeSet::new();
            let mut round = Vec::new();
            for group in groups.iter_mut() {
                if group.conflicts_with(&claimed) {
                    continue;
                }
                if let Some(index) = group.tests.iter().position(|t| t.dependencies_terminal()) {
                    claimed.extend(group.keys.iter().cloned());
                    round.push(group.tests.remove(index));
                }
            }

            if round.is_empty() {
                if !self.wait_for_completion(&mut changes).await {
                    return;
                }
                continue;
            }

            round_number += 1;
            debug!(round = round_number, size = round.len(), "starting keyed round");
            let handles: Vec<_> = round.into_iter().map(|test| self.spawn_test(test)).collect();
            self.join(handles).await;
        }
    }

    /// Block until some test completes; false when no more can
    async fn wait_for_completion(&self, changes: &mut watch::Receiver<u64>) -> bool {
        if changes.changed().await.is_err() {
            self.record_fatal(EngineError::Internal("completion channel closed".to_string()));
            return false;
        }
        true
    }

    fn spawn_test(self: &Arc<Self>, test: Arc<ExecutableTest>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_one(test).await })
    }

    async fn join(&self, handles: Vec<JoinHandle<()>>) {
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                self.record_fatal(e.into());
            }
        }
    }

    async fn run_one(&self, test: Arc<ExecutableTest>) {
        if let Err(e) = self.drive(&test).await {
            error!(test_id = %test.id(), error = %e, "fatal error while running test");
            self.record_fatal(e);
        }
        self.completions.send_modify(|n| *n += 1);
    }

    async fn drive(&self, test: &ExecutableTest) -> Result<()> {
        if test.is_terminal() {
            return Ok(());
        }

        let dependencies = test.dependencies();
        if !dependencies.is_empty() {
            test.set_state(TestState::WaitingForDependencies);
            join_all(dependencies.iter().map(|d| d.wait_terminal())).await;
        }
        test.set_state(TestState::Queued);

        let admission = self.admit(test).await?;
        let chain = self.orchestrator.scope_chain(&test.metadata().class);
        let executed = self.executor.execute(test, &chain).await;
        self.executing.fetch_sub(1, Ordering::SeqCst);
        drop(admission);

        let result = executed?;
        self.sink.report(test, &result).await;
        if self.options.fail_fast && result.is_failure() && !self.run_token.is_cancelled() {
            info!(test_id = %test.id(), "fail-fast: cancelling remaining tests");
            self.run_token.cancel();
        }
        Ok(())
    }

    /// Take every permit the test needs, then claim an executing slot
    async fn admit(&self, test: &ExecutableTest) -> Result<Admission> {
        let meta = test.metadata();
        let assembly = self.options.assembly_limits.get(&meta.class.assembly).map(|limit| {
            self.assemblies
                .entry(meta.class.assembly.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(*limit)))
                .clone()
        });
        let limiter = meta.parallel_limit.as_ref().map(|l| {
            self.limiters
                .entry(l.name.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(l.limit.max(1))))
                .clone()
        });

        let admission = Admission {
            _global: acquire(self.global.clone()).await?,
            _assembly: acquire(assembly).await?,
            _limiter: acquire(limiter).await?,
        };
        self.claim_slot(test).await;
        Ok(admission)
    }

    /// Count one more executing test. While the system is strained a slot is
    /// only granted when nothing else is executing.
    async fn claim_slot(&self, test: &ExecutableTest) {
        loop {
            if !self.monitor.is_strained() || self.run_token.is_cancelled() {
                self.executing.fetch_add(1, Ordering::SeqCst);
                return;
            }
            if self
                .executing
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
            trace!(test_id = %test.id(), "system strained, delaying admission");
            tokio::select! {
                _ = self.run_token.cancelled() => {}
                _ = tokio::time::sleep(self.options.strain_backoff) => {}
            }
        }
    }

    fn record_fatal(&self, err: EngineError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.run_token.cancel();
    }
}

async fn acquire(semaphore: Option<Arc<Semaphore>>) -> Result<Option<OwnedSemaphorePermit>> {
    match semaphore {
        None => Ok(None),
        Some(s) => s
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|e| EngineError::Internal(format!("admission semaphore closed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TestContext;
    use crate::dependency::resolve_dependencies;
    use crate::error::TestOutcome;
    use crate::executable::TestStatus;
    use crate::grouper::group_tests;
    use crate::hooks::HookRegistry;
    use crate::invoker::FnInvoker;
    use crate::metadata::{ClassInfo, DependencyMatcher, InvokerBinding, TestMetadata};
    use crate::monitor::NeverStrained;
    use crate::reporter::CollectingSink;
    use std::future::Future;
    use std::sync::atomic::AtomicBool;

    /// Tracks how many bodies run at once and the peak
    #[derive(Default)]
    struct Gauge {
        now: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        async fn hold(&self, for_ms: u64) {
            let now = self.now.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(for_ms)).await;
            self.now.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    fn meta_with<F, Fut>(class: ClassInfo, method: &str, body: F) -> TestMetadata
    where
        F: Fn(Vec<crate::ArgValue>, TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        TestMetadata::new(class, method, InvokerBinding::Direct(Arc::new(FnInvoker::stateless(body))))
    }

    fn gauged(gauge: &Arc<Gauge>, class: ClassInfo, method: &str, ms: u64) -> TestMetadata {
        let gauge = gauge.clone();
        meta_with(class, method, move |_a, _c| {
            let gauge = gauge.clone();
            async move {
                gauge.hold(ms).await;
                Ok(())
            }
        })
    }

    fn make(meta: TestMetadata) -> Arc<ExecutableTest> {
        let meta = Arc::new(meta);
        let invoker = meta.invoker.resolve(&Default::default()).ok();
        Arc::new(ExecutableTest::new(
            meta.id.clone(),
            meta.method_name.clone(),
            meta,
            vec![],
            vec![],
            vec![],
            invoker,
        ))
    }

    struct Run {
        sink: Arc<CollectingSink>,
        outcome: Result<()>,
    }

    async fn run_all(
        tests: &[Arc<ExecutableTest>],
        options: SchedulerOptions,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Run {
        let token = CancellationToken::new();
        let orchestrator = Arc::new(LifecycleOrchestrator::new(Arc::new(HookRegistry::new()), token.clone()));
        resolve_dependencies(tests);
        for test in tests.iter().filter(|t| !t.is_terminal()) {
            orchestrator.register_test(&test.metadata().class).unwrap();
        }
        let sink = Arc::new(CollectingSink::new());
        let scheduler = Arc::new(TestScheduler::new(
            orchestrator,
            monitor,
            sink.clone(),
            options,
            None,
            token,
        ));
        let outcome = scheduler.run(group_tests(tests)).await;
        Run { sink, outcome }
    }

    fn options() -> SchedulerOptions {
        SchedulerOptions {
            max_parallelism: 0,
            assembly_limits: HashMap::new(),
            strain_backoff: Duration::from_millis(5),
            fail_fast: false,
        }
    }

    #[tokio::test]
    async fn test_global_cap() {
        let gauge = Arc::new(Gauge::default());
        let tests: Vec<_> = (0..8)
            .map(|i| make(gauged(&gauge, ClassInfo::new("Cap"), &format!("t{}", i), 20)))
            .collect();

        let run = run_all(&tests, SchedulerOptions { max_parallelism: 3, ..options() }, Arc::new(NeverStrained)).await;
        run.outcome.unwrap();

        assert_eq!(run.sink.results().len(), 8);
        assert!(gauge.peak() <= 3);
        assert!(gauge.peak() >= 2);
    }

    #[tokio::test]
    async fn test_assembly_caps_are_independent() {
        let slow = Arc::new(Gauge::default());
        let fast = Arc::new(Gauge::default());
        let mut tests = Vec::new();
        for i in 0..6 {
            tests.push(make(gauged(&slow, ClassInfo::new("A").in_assembly("slow"), &format!("t{}", i), 20)));
            tests.push(make(gauged(&fast, ClassInfo::new("B").in_assembly("fast"), &format!("t{}", i), 20)));
        }

        let mut opts = options();
        opts.assembly_limits.insert("slow".to_string(), 1);
        let run = run_all(&tests, opts, Arc::new(NeverStrained)).await;
        run.outcome.unwrap();

        assert_eq!(slow.peak(), 1);
        assert!(fast.peak() > 1);
    }

    #[tokio::test]
    async fn test_named_limiter() {
        let gauge = Arc::new(Gauge::default());
        let tests: Vec<_> = (0..6)
            .map(|i| {
                make(gauged(&gauge, ClassInfo::new("Lim"), &format!("t{}", i), 15).with_parallel_limit("pair", 2))
            })
            .collect();

        run_all(&tests, options(), Arc::new(NeverStrained)).await.outcome.unwrap();
        assert!(gauge.peak() <= 2);
    }

    #[tokio::test]
    async fn test_serial_lane_is_sequential() {
        let gauge = Arc::new(Gauge::default());
        let tests: Vec<_> = (0..4)
            .map(|i| {
                make(gauged(&gauge, ClassInfo::new("Ser"), &format!("t{}", i), 10).not_in_parallel(Vec::<String>::new()))
            })
            .collect();

        run_all(&tests, options(), Arc::new(NeverStrained)).await.outcome.unwrap();
        assert_eq!(gauge.peak(), 1);
    }

    #[tokio::test]
    async fn test_keyed_groups_exclude_shared_keys() {
        let shared = Arc::new(Gauge::default());
        let k1 = Arc::new(Gauge::default());
        let k2 = Arc::new(Gauge::default());
        let mut tests = Vec::new();
        for i in 0..3 {
            // {K} and {K, L} share K, so none of these may overlap
            tests.push(make(gauged(&shared, ClassInfo::new("Key"), &format!("k{}", i), 10).not_in_parallel(["K"])));
            tests.push(make(gauged(&shared, ClassInfo::new("Key"), &format!("kl{}", i), 10).not_in_parallel(["K", "L"])));
            tests.push(make(gauged(&k1, ClassInfo::new("Key"), &format!("k1_{}", i), 20).not_in_parallel(["K1"])));
            tests.push(make(gauged(&k2, ClassInfo::new("Key"), &format!("k2_{}", i), 20).not_in_parallel(["K2"])));
        }

        run_all(&tests, options(), Arc::new(NeverStrained)).await.outcome.unwrap();
        assert_eq!(shared.peak(), 1);
        assert_eq!(k1.peak(), 1);
        assert_eq!(k2.peak(), 1);
    }

    #[tokio::test]
    async fn test_disjoint_keys_run_concurrently() {
        let gauge = Arc::new(Gauge::default());
        let tests = vec![
            make(gauged(&gauge, ClassInfo::new("Key"), "a", 40).not_in_parallel(["K1"])),
            make(gauged(&gauge, ClassInfo::new("Key"), "b", 40).not_in_parallel(["K2"])),
        ];
        run_all(&tests, options(), Arc::new(NeverStrained)).await.outcome.unwrap();
        assert_eq!(gauge.peak(), 2);
    }

    #[tokio::test]
    async fn test_dependent_waits_for_dependency_across_lanes() {
        let first_done = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(AtomicBool::new(false));

        let flag = first_done.clone();
        let first = meta_with(ClassInfo::new("Dep"), "first", move |_a, _c| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                flag.store(true, Ordering::SeqCst);
                Err(crate::error::TestError::assertion("first fails"))
            }
        })
        .not_in_parallel(["K"]);

        let (flag, seen) = (first_done.clone(), observed.clone());
        let second = meta_with(ClassInfo::new("Dep"), "second", move |_a, _c| {
            let (flag, seen) = (flag.clone(), seen.clone());
            async move {
                seen.store(flag.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            }
        })
        .depends_on(DependencyMatcher::method("first"));

        let tests = vec![make(second), make(first)];
        let run = run_all(&tests, options(), Arc::new(NeverStrained)).await;
        run.outcome.unwrap();

        assert!(observed.load(Ordering::SeqCst));
        // A failed dependency does not fail the dependent
        assert_eq!(tests[0].result().unwrap().status, TestStatus::Passed);
        assert_eq!(tests[1].result().unwrap().status, TestStatus::Failed);
    }

    struct AlwaysStrained;

    impl ResourceMonitor for AlwaysStrained {
        fn is_strained(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_strain_still_makes_progress_one_at_a_time() {
        let gauge = Arc::new(Gauge::default());
        let tests: Vec<_> = (0..4)
            .map(|i| make(gauged(&gauge, ClassInfo::new("Strain"), &format!("t{}", i), 10)))
            .collect();

        let run = run_all(&tests, options(), Arc::new(AlwaysStrained)).await;
        run.outcome.unwrap();
        assert_eq!(run.sink.results().len(), 4);
        assert!(tests.iter().all(|t| t.result().unwrap().is_passed()));
        assert_eq!(gauge.peak(), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_remaining() {
        let mut tests = vec![make(
            meta_with(ClassInfo::new("Ff"), "boom", |_a, _c| async { Err(crate::error::TestError::assertion("no")) })
                .not_in_parallel(Vec::<String>::new())
                .with_priority(10),
        )];
        for i in 0..3 {
            tests.push(make(
                meta_with(ClassInfo::new("Ff"), &format!("later{}", i), |_a, _c| async { Ok(()) })
                    .not_in_parallel(Vec::<String>::new()),
            ));
        }

        let run = run_all(&tests, SchedulerOptions { fail_fast: true, ..options() }, Arc::new(NeverStrained)).await;
        run.outcome.unwrap();

        assert_eq!(tests[0].result().unwrap().status, TestStatus::Failed);
        for test in &tests[1..] {
            assert_eq!(test.result().unwrap().status, TestStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_every_test_reaches_a_terminal_state() {
        let tests: Vec<_> = (0..10)
            .map(|i| {
                let meta = meta_with(ClassInfo::new("All"), &format!("t{}", i), |_a, _c| async { Ok(()) });
                match i % 3 {
                    0 => make(meta),
                    1 => make(meta.not_in_parallel(Vec::<String>::new())),
                    _ => make(meta.not_in_parallel([format!("key{}", i % 2)])),
                }
            })
            .collect();

        let run = run_all(&tests, options(), Arc::new(NeverStrained)).await;
        run.outcome.unwrap();
        assert!(tests.iter().all(|t| t.is_terminal()));
        assert_eq!(run.sink.results().len(), 10);
    }
}
