//! ouroboros-unit: test execution engine
//!
//! Takes discovered test metadata and drives it to terminal results:
//! - Data-driven expansion (class × method × property rows, bounded)
//! - Dependency resolution with unresolved and circular diagnostics
//! - Grouping into parallel, globally serial and keyed lanes
//! - Session/assembly/class hooks with counted, exactly-once teardown
//! - Per-test retries, timeouts, cancellation and output capture
//! - Admission control (global, per-assembly and named limits, strain backoff)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ouroboros_unit::{
//!     args, ClassInfo, CollectingSink, DataSource, EngineConfig, FnInvoker, InvokerBinding,
//!     StaticMetadataSource, TestMetadata, TestSession,
//! };
//!
//! # async fn demo() -> ouroboros_unit::Result<()> {
//! let adds = TestMetadata::new(
//!     ClassInfo::new("Math"),
//!     "adds",
//!     InvokerBinding::Direct(Arc::new(FnInvoker::stateless(|args, _ctx| async move {
//!         let (a, b) = (args[0].as_i64(), args[1].as_i64());
//!         if a.zip(b).map_or(false, |(a, b)| a + b > a) {
//!             Ok(())
//!         } else {
//!             Err(ouroboros_unit::TestError::assertion("sum did not grow"))
//!         }
//!     }))),
//! )
//! .with_data(DataSource::Inline(vec![args![1, 2], args![3, 4]]));
//!
//! let outcome = TestSession::new(EngineConfig::default())
//!     .with_source(StaticMetadataSource::new(vec![adds]))
//!     .with_sink(Arc::new(CollectingSink::new()))
//!     .run()
//!     .await?;
//! assert_eq!(outcome.summary.passed, 2);
//! # Ok(())
//! # }
//! ```

pub mod attempt;
pub mod capture;
pub mod config;
pub mod context;
pub mod dependency;
pub mod error;
pub mod executable;
pub mod executor;
pub mod expander;
pub mod filter;
pub mod grouper;
pub mod hooks;
pub mod invoker;
pub mod lifecycle;
pub mod logging;
pub mod metadata;
pub mod monitor;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod scope;
pub mod session;
pub mod source;
pub mod value;

// Re-export main types
pub use attempt::{AttemptPhase, AttemptScope};
pub use capture::OutputCapture;
pub use config::EngineConfig;
pub use context::{HookContext, TestContext};
pub use dependency::{resolve_dependencies, DependencyReport};
pub use error::{EngineError, ExpansionError, Failures, Result, TestError, TestOutcome};
pub use executable::{ExecutableTest, TestResult, TestState, TestStatus};
pub use executor::SingleTestExecutor;
pub use expander::{Combination, ExpansionLimits, TestExpander};
pub use filter::TestFilter;
pub use grouper::{group_tests, GroupedTests, KeyedGroup};
pub use hooks::{HookDescriptor, HookInvoker, HookRegistry, HookType};
pub use invoker::{FnInvoker, InstanceBox, InvokerRegistry, TestInstance, TestInvoker};
pub use lifecycle::{LifecycleOrchestrator, ScopePhase};
pub use logging::init_logging;
pub use metadata::{
    ClassInfo, DataSource, DependencyMatcher, InvokerBinding, ParallelLimit, PropertySource, TestMetadata,
    DEFAULT_ASSEMBLY,
};
pub use monitor::{NeverStrained, ResourceMonitor, ResourceSampler, SampledResourceMonitor, SystemSampler};
pub use reporter::{CollectingSink, LogSink, MultiSink, ReportFormat, ResultSink, RunSummary, TestReport};
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerOptions, TestScheduler};
pub use scope::{ScopeChain, ScopeId};
pub use session::{RunOutcome, TestSession};
pub use source::{DataSourceRegistry, DataSourceResolver, MetadataSource, Row, StaticMetadataSource};
pub use value::ArgValue;
