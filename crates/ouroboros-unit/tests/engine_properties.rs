//! End-to-end behaviour of the engine through its public API

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ouroboros_unit::{
    ArgValue, ClassInfo, CollectingSink, DataSource, DependencyMatcher, EngineConfig, EngineError,
    ExpansionError, FnInvoker, HookDescriptor, HookRegistry, InvokerBinding, LifecycleOrchestrator,
    RunOutcome, ScopeId, StaticMetadataSource, TestContext, TestError, TestMetadata, TestOutcome,
    TestSession, TestStatus,
};
use tokio_util::sync::CancellationToken;

fn test<F, Fut>(class: &str, method: &str, body: F) -> TestMetadata
where
    F: Fn(Vec<ArgValue>, TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TestOutcome> + Send + 'static,
{
    TestMetadata::new(
        ClassInfo::new(class),
        method,
        InvokerBinding::Direct(Arc::new(FnInvoker::stateless(body))),
    )
}

fn passing(class: &str, method: &str) -> TestMetadata {
    test(class, method, |_args, _ctx| async { Ok(()) })
}

async fn run(session: TestSession, tests: Vec<TestMetadata>) -> RunOutcome {
    session
        .with_source(StaticMetadataSource::new(tests))
        .with_sink(Arc::new(CollectingSink::new()))
        .run()
        .await
        .expect("run should not fail")
}

async fn run_default(tests: Vec<TestMetadata>) -> RunOutcome {
    run(TestSession::new(EngineConfig::default()), tests).await
}

/// Tracks overlapping executions
#[derive(Default)]
struct Overlap {
    now: AtomicUsize,
    peak: AtomicUsize,
}

impl Overlap {
    async fn hold(&self, ms: u64) {
        let now = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.now.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn expansion_follows_cartesian_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let meta = test("Grid", "pairs", move |args, _ctx| {
        let log = log.clone();
        async move {
            log.lock().push(args);
            Ok(())
        }
    })
    .with_data(DataSource::values([1, 2]))
    .with_data(DataSource::values(["a", "b"]));

    let outcome = run_default(vec![meta]).await;

    let names: Vec<&str> = outcome.results.iter().map(|r| r.display_name.as_str()).collect();
    assert_eq!(
        names,
        vec!["pairs(1, \"a\")", "pairs(1, \"b\")", "pairs(2, \"a\")", "pairs(2, \"b\")"]
    );
    let ids: Vec<&str> = outcome.results.iter().map(|r| r.test_id.as_str()).collect();
    assert_eq!(ids[0], "Grid.pairs[1, \"a\"]");
    assert_eq!(ids[3], "Grid.pairs[2, \"b\"]");
    assert_eq!(seen.lock().len(), 4);
    assert_eq!(outcome.summary.passed, 4);
}

#[tokio::test]
async fn empty_source_produces_no_tests() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let empty = test("Grid", "never", move |_args, _ctx| {
        let flag = flag.clone();
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .with_data(DataSource::values([1, 2]))
    .with_data(DataSource::rows(vec![]));

    let outcome = run_default(vec![empty, passing("Grid", "other")]).await;

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].test_id, "Grid.other");
}

#[tokio::test]
async fn combination_limit_fails_instead_of_truncating() {
    let config = EngineConfig::default().with_max_combinations(10);
    let too_many = passing("Grid", "big").with_data(DataSource::values(0..11));
    let fits = passing("Grid", "fits").with_data(DataSource::values(0..10));

    let outcome = run(TestSession::new(config), vec![too_many, fits]).await;

    let big = outcome.result("Grid.big").unwrap();
    assert_eq!(big.status, TestStatus::Failed);
    assert_eq!(
        big.error,
        Some(TestError::Expansion(ExpansionError::TooManyCombinations { limit: 10 }))
    );
    // The unrelated test still runs
    let fits: Vec<_> = outcome.results.iter().filter(|r| r.test_id.starts_with("Grid.fits")).collect();
    assert_eq!(fits.len(), 10);
    assert!(fits.iter().all(|r| r.is_passed()));
}

#[tokio::test]
async fn counter_underflow_is_fatal() {
    let orchestrator = LifecycleOrchestrator::new(Arc::new(HookRegistry::new()), CancellationToken::new());
    let class = ClassInfo::new("Counted");
    let mut chain = None;
    for _ in 0..3 {
        chain = Some(orchestrator.register_test(&class).unwrap());
    }
    let chain = chain.unwrap();

    for _ in 0..3 {
        orchestrator.complete_test(&chain).await.unwrap();
    }
    let err = orchestrator.complete_test(&chain).await.unwrap_err();
    assert!(matches!(err, EngineError::CounterUnderflow { .. }));
    assert_eq!(orchestrator.remaining(&ScopeId::Class("Counted".into())), Some(0));
}

#[tokio::test]
async fn class_setup_runs_once_for_fifty_concurrent_tests() {
    let setups = Arc::new(AtomicU32::new(0));
    let ready = Arc::new(AtomicBool::new(false));

    let (count, flag) = (setups.clone(), ready.clone());
    let hooks = HookRegistry::new().with_hook(
        HookDescriptor::setup(ScopeId::Class("Shared".into()), "open_pool"),
        move |_ctx| {
            let (count, flag) = (count.clone(), flag.clone());
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        },
    );

    let flag = ready.clone();
    let meta = test("Shared", "uses_pool", move |_args, _ctx| {
        let flag = flag.clone();
        async move {
            if flag.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TestError::assertion("body ran before class setup finished"))
            }
        }
    })
    .with_data(DataSource::values(0..50));

    let config = EngineConfig::default().with_max_parallelism(0);
    let outcome = run(TestSession::new(config).with_hooks(hooks), vec![meta]).await;

    assert_eq!(setups.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.summary.passed, 50);
}

#[tokio::test]
async fn teardown_failures_are_aggregated() {
    let scope = ScopeId::Class("Cleanup".into());
    let hooks = HookRegistry::new()
        .with_hook(HookDescriptor::setup(scope.clone(), "open"), |_ctx| async { Ok(()) })
        .with_hook(HookDescriptor::teardown(scope.clone(), "first").with_order(1), |_ctx| async {
            Err(TestError::assertion("first cleanup"))
        })
        .with_hook(HookDescriptor::teardown(scope.clone(), "second").with_order(2), |_ctx| async { Ok(()) })
        .with_hook(HookDescriptor::teardown(scope.clone(), "third").with_order(3), |_ctx| async {
            Err(TestError::assertion("third cleanup"))
        });

    let outcome = run(
        TestSession::new(EngineConfig::default()).with_hooks(hooks),
        vec![passing("Cleanup", "only")],
    )
    .await;

    let result = outcome.result("Cleanup.only").unwrap();
    assert_eq!(result.status, TestStatus::Failed);
    assert_eq!(
        result.error,
        Some(TestError::Aggregate(vec![
            TestError::assertion("first cleanup"),
            TestError::assertion("third cleanup"),
        ]))
    );
}

#[tokio::test]
async fn single_teardown_failure_is_not_wrapped() {
    let scope = ScopeId::Class("Cleanup".into());
    let hooks = HookRegistry::new()
        .with_hook(HookDescriptor::setup(scope.clone(), "open"), |_ctx| async { Ok(()) })
        .with_hook(HookDescriptor::teardown(scope, "close"), |_ctx| async {
            Err(TestError::assertion("close failed"))
        });

    let outcome = run(
        TestSession::new(EngineConfig::default()).with_hooks(hooks),
        vec![passing("Cleanup", "only")],
    )
    .await;

    let result = outcome.result("Cleanup.only").unwrap();
    assert_eq!(result.status, TestStatus::Failed);
    assert_eq!(result.error, Some(TestError::assertion("close failed")));
}

#[tokio::test]
async fn shared_key_excludes_and_disjoint_keys_overlap() {
    let shared = Arc::new(Overlap::default());
    let disjoint = Arc::new(Overlap::default());

    let gauge = |overlap: &Arc<Overlap>, method: &str, keys: &[&str]| {
        let overlap = overlap.clone();
        test("Keys", method, move |_args, _ctx| {
            let overlap = overlap.clone();
            async move {
                overlap.hold(40).await;
                Ok(())
            }
        })
        .not_in_parallel(keys.iter().copied())
    };

    let tests = vec![
        gauge(&shared, "k_one", &["K"]),
        gauge(&shared, "k_two", &["K"]),
        gauge(&shared, "k_three", &["K", "X"]),
        gauge(&disjoint, "k1", &["K1"]),
        gauge(&disjoint, "k2", &["K2"]),
    ];
    let outcome = run_default(tests).await;

    assert_eq!(outcome.summary.passed, 5);
    assert_eq!(shared.peak(), 1);
    assert_eq!(disjoint.peak(), 2);
}

#[tokio::test]
async fn timeout_is_reported_as_timeout() {
    let hangs = test("Slow", "hangs", |_args, _ctx| async {
        std::future::pending::<()>().await;
        Ok(())
    })
    .with_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let outcome = run_default(vec![hangs]).await;

    let result = outcome.result("Slow.hangs").unwrap();
    assert_eq!(result.status, TestStatus::Timeout);
    assert!(matches!(result.error, Some(TestError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome.summary.timed_out, 1);
}

#[tokio::test]
async fn run_cancellation_is_not_a_timeout() {
    let hangs = test("Slow", "waits", |_args, _ctx| async {
        std::future::pending::<()>().await;
        Ok(())
    })
    .with_timeout(Duration::from_secs(30));

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let outcome = run(
        TestSession::new(EngineConfig::default()).with_cancellation_token(token),
        vec![hangs],
    )
    .await;

    let result = outcome.result("Slow.waits").unwrap();
    assert_eq!(result.status, TestStatus::Cancelled);
    assert_eq!(result.error, Some(TestError::Cancelled));
    assert_eq!(outcome.summary.cancelled, 1);
}

#[tokio::test]
async fn retry_keeps_only_the_final_attempt_output() {
    let flaky = test("Flaky", "third_time_lucky", |_args, ctx| async move {
        ouroboros_unit::test_println!("attempt {}", ctx.attempt);
        if ctx.attempt < 3 {
            Err(TestError::assertion(format!("attempt {} failed", ctx.attempt)))
        } else {
            Ok(())
        }
    })
    .with_retries(2);

    let outcome = run_default(vec![flaky]).await;

    let result = outcome.result("Flaky.third_time_lucky").unwrap();
    assert_eq!(result.status, TestStatus::Passed);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.stdout, "attempt 3\n");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn dependent_starts_after_dependency_is_terminal() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let order = log.clone();
    let first = test("Flow", "login", move |_args, _ctx| {
        let order = order.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            order.lock().push("login done");
            Ok(())
        }
    });
    let order = log.clone();
    let second = test("Flow", "checkout", move |_args, _ctx| {
        let order = order.clone();
        async move {
            order.lock().push("checkout started");
            Ok(())
        }
    })
    .depends_on(DependencyMatcher::method("login"));

    let outcome = run_default(vec![second, first]).await;

    assert_eq!(*log.lock(), vec!["login done", "checkout started"]);
    assert_eq!(outcome.summary.passed, 2);
}

#[tokio::test]
async fn circular_dependencies_fail_without_hanging() {
    let a = passing("Loop", "a").depends_on(DependencyMatcher::method("b"));
    let b = passing("Loop", "b").depends_on(DependencyMatcher::method("a"));
    let free = passing("Loop", "free");

    let outcome = tokio::time::timeout(Duration::from_secs(5), run_default(vec![a, b, free]))
        .await
        .expect("circular dependencies must not hang the run");

    for id in ["Loop.a", "Loop.b"] {
        let result = outcome.result(id).unwrap();
        assert_eq!(result.status, TestStatus::Failed);
        assert!(matches!(result.error, Some(TestError::CircularDependency(_))), "{:?}", result.error);
    }
    assert!(outcome.result("Loop.free").unwrap().is_passed());
}

#[tokio::test]
async fn unresolved_dependency_fails_the_dependent() {
    let orphan = passing("Flow", "orphan").depends_on(DependencyMatcher::method("missing"));
    let outcome = run_default(vec![orphan]).await;

    let result = outcome.result("Flow.orphan").unwrap();
    assert_eq!(result.status, TestStatus::Failed);
    assert!(matches!(result.error, Some(TestError::UnresolvedDependency(_))));
}
