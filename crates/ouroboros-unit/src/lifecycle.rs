//! Lifecycle orchestration for session, assembly and class scopes
//!
//! Every scope keeps a "remaining tests" counter. Registering a test bumps
//! the counter of every scope in its chain; completing it decrements them
//! innermost first. One-time setup is memoized per scope so concurrent first
//! callers share one execution, and one-time teardown fires when a counter
//! reaches zero.
//!
//! One orchestrator is built per run; nothing here is global.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::attempt::catch_panic;
use crate::context::HookContext;
use crate::error::{EngineError, Failures, Result, TestError, TestOutcome};
use crate::hooks::{HookDescriptor, HookInvoker, HookRegistry, HookType};
use crate::invoker::InstanceBox;
use crate::metadata::ClassInfo;
use crate::scope::{ScopeChain, ScopeId};

/// Lifecycle phase of one scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopePhase {
    Uninitialized,
    SettingUp,
    Ready,
    TearingDown,
    Done,
}

#[derive(Debug)]
struct ScopeCounter {
    remaining: usize,
    registered: usize,
    phase: ScopePhase,
}

struct ScopeState {
    id: ScopeId,
    counter: Mutex<ScopeCounter>,
    setup: OnceCell<TestOutcome>,
}

impl ScopeState {
    fn new(id: ScopeId) -> Self {
        Self {
            id,
            counter: Mutex::new(ScopeCounter {
                remaining: 0,
                registered: 0,
                phase: ScopePhase::Uninitialized,
            }),
            setup: OnceCell::new(),
        }
    }

    fn set_phase(&self, phase: ScopePhase) {
        self.counter.lock().phase = phase;
    }
}

/// Drives one-time setup and teardown for every scope of a run
pub struct LifecycleOrchestrator {
    hooks: Arc<HookRegistry>,
    invoker: Arc<dyn HookInvoker>,
    scopes: DashMap<ScopeId, Arc<ScopeState>>,
    chains: DashMap<String, Arc<ScopeChain>>,
    token: CancellationToken,
}

impl LifecycleOrchestrator {
    /// Orchestrator whose hooks are run by the registry's own closures
    pub fn new(hooks: Arc<HookRegistry>, token: CancellationToken) -> Self {
        let invoker: Arc<dyn HookInvoker> = hooks.clone();
        Self::with_invoker(hooks, invoker, token)
    }

    pub fn with_invoker(
        hooks: Arc<HookRegistry>,
        invoker: Arc<dyn HookInvoker>,
        token: CancellationToken,
    ) -> Self {
        Self {
            hooks,
            invoker,
            scopes: DashMap::new(),
            chains: DashMap::new(),
            token,
        }
    }

    /// Scope chain of a class, computed once and cached
    pub fn scope_chain(&self, class: &ClassInfo) -> Arc<ScopeChain> {
        self.chains
            .entry(class.name.clone())
            .or_insert_with(|| Arc::new(ScopeChain::for_class(class)))
            .clone()
    }

    fn state(&self, scope: &ScopeId) -> Result<Arc<ScopeState>> {
        self.scopes
            .get(scope)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::ScopeNotRegistered(scope.to_string()))
    }

    /// Count one more test against every scope of its class chain
    pub fn register_test(&self, class: &ClassInfo) -> Result<Arc<ScopeChain>> {
        let chain = self.scope_chain(class);
        for scope in chain.leaf_to_root() {
            let state = self
                .scopes
                .entry(scope.clone())
                .or_insert_with(|| Arc::new(ScopeState::new(scope.clone())))
                .clone();
            let mut counter = state.counter.lock();
            if counter.phase == ScopePhase::Done {
                return Err(EngineError::ScopeClosed(scope.to_string()));
            }
            counter.remaining += 1;
            counter.registered += 1;
        }
        Ok(chain)
    }

    /// Run one-time setup for every scope of the chain, outermost first.
    ///
    /// Each scope's setup runs at most once; concurrent callers await the
    /// same execution and all observe its outcome. The first failing scope
    /// stops the walk and is reported as [`TestError::SetupFailed`].
    pub async fn ensure_setup(&self, chain: &ScopeChain) -> Result<TestOutcome> {
        for scope in chain.root_to_leaf() {
            let state = self.state(scope)?;
            let outcome = state
                .setup
                .get_or_init(|| self.run_setup(state.clone()))
                .await
                .clone();
            if let Err(cause) = outcome {
                if cause.is_cancelled() {
                    return Ok(Err(TestError::Cancelled));
                }
                return Ok(Err(TestError::SetupFailed {
                    scope: scope.to_string(),
                    cause: Box::new(cause),
                }));
            }
        }
        Ok(Ok(()))
    }

    async fn run_setup(&self, state: Arc<ScopeState>) -> TestOutcome {
        state.set_phase(ScopePhase::SettingUp);
        debug!(scope = %state.id, "running one-time setup");

        let mut outcome = Ok(());
        for hook in self.hooks.scope_hooks(&state.id, HookType::SetupScope) {
            if let Err(e) = self.invoke(&hook, None, None).await {
                error!(scope = %state.id, hook = %hook.name, error = %e, "one-time setup failed");
                outcome = Err(e);
                break;
            }
        }

        state.set_phase(ScopePhase::Ready);
        outcome
    }

    /// Count a test as finished.
    ///
    /// Decrements innermost to outermost; every scope that reaches zero runs
    /// its one-time teardown (if its setup was ever attempted). Teardown
    /// failures are collected, never thrown individually. A counter that
    /// would go negative is a fatal error.
    pub async fn complete_test(&self, chain: &ScopeChain) -> Result<Failures> {
        let mut failures = Failures::new();

        for scope in chain.leaf_to_root() {
            let state = self.state(scope)?;
            let run_teardown = {
                let mut counter = state.counter.lock();
                if counter.remaining == 0 {
                    return Err(EngineError::CounterUnderflow {
                        scope: scope.to_string(),
                    });
                }
                counter.remaining -= 1;
                if counter.remaining > 0 {
                    continue;
                }
                let attempted = state.setup.initialized();
                counter.phase = if attempted {
                    ScopePhase::TearingDown
                } else {
                    ScopePhase::Done
                };
                attempted
            };

            if run_teardown {
                failures.extend(self.run_teardown(&state).await);
                state.set_phase(ScopePhase::Done);
            }
        }

        Ok(failures)
    }

    async fn run_teardown(&self, state: &ScopeState) -> Failures {
        debug!(scope = %state.id, "running one-time teardown");
        let mut failures = Failures::new();
        for hook in self.hooks.scope_hooks(&state.id, HookType::TeardownScope) {
            if let Err(e) = self.invoke(&hook, None, None).await {
                warn!(scope = %state.id, hook = %hook.name, error = %e, "one-time teardown failed");
                failures.push(e);
            }
        }
        failures
    }

    /// Run the per-test setup hooks of the chain; the first failure stops them
    pub async fn run_method_setup(
        &self,
        chain: &ScopeChain,
        instance: &mut InstanceBox,
        test_id: &str,
    ) -> TestOutcome {
        for hook in self.hooks.method_hooks(chain, HookType::SetupMethod) {
            let target = if hook.receives_instance() {
                Some(&mut *instance)
            } else {
                None
            };
            self.invoke(&hook, target, Some(test_id)).await?;
        }
        Ok(())
    }

    /// Run every per-test teardown hook of the chain, collecting failures
    pub async fn run_method_teardown(
        &self,
        chain: &ScopeChain,
        instance: &mut InstanceBox,
        test_id: &str,
    ) -> Failures {
        let mut failures = Failures::new();
        for hook in self.hooks.method_hooks(chain, HookType::TeardownMethod) {
            let target = if hook.receives_instance() {
                Some(&mut *instance)
            } else {
                None
            };
            failures.record(self.invoke(&hook, target, Some(test_id)).await);
        }
        failures
    }

    /// Run one hook under its own timeout, with panics reported as failures.
    ///
    /// Setup hooks are also raced against the run token. Teardown hooks are
    /// not, so a cancelled run still releases what its setups acquired.
    async fn invoke(
        &self,
        hook: &HookDescriptor,
        instance: Option<&mut InstanceBox>,
        test_id: Option<&str>,
    ) -> TestOutcome {
        let ctx = HookContext::new(
            hook.name.clone(),
            hook.scope.clone(),
            test_id.map(str::to_string),
            self.token.child_token(),
        );
        let call = catch_panic(self.invoker.invoke_hook(hook, instance, &ctx));
        let bounded = async {
            match hook.timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(TestError::hook(
                        &hook.name,
                        format!("timed out after {:?}", limit),
                    )),
                },
                None => call.await,
            }
        };

        let outcome = if hook.hook_type.is_setup() {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(TestError::Cancelled),
                outcome = bounded => outcome,
            }
        } else {
            bounded.await
        };

        if outcome.is_err() {
            ctx.cancellation_token().cancel();
        }
        outcome
    }

    /// Remaining-test count of a scope
    pub fn remaining(&self, scope: &ScopeId) -> Option<usize> {
        self.scopes.get(scope).map(|s| s.counter.lock().remaining)
    }

    /// Total tests ever registered against a scope
    pub fn registered(&self, scope: &ScopeId) -> Option<usize> {
        self.scopes.get(scope).map(|s| s.counter.lock().registered)
    }

    pub fn phase(&self, scope: &ScopeId) -> Option<ScopePhase> {
        self.scopes.get(scope).map(|s| s.counter.lock().phase)
    }
}
