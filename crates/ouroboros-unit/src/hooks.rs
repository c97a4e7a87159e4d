//! Test lifecycle hooks system
//!
//! Hooks are attached to a scope (session, assembly or class) and come in
//! two flavours:
//! - Scope hooks: `setup_scope` runs once before the first test of the scope,
//!   `teardown_scope` once after its last test.
//! - Method hooks: `setup_method` / `teardown_method` run around every test in
//!   the scope (and, for a class, every test of a derived class).
//!
//! The [`HookRegistry`] holds descriptors and, for hooks registered with a
//! closure, also acts as their [`HookInvoker`].

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::context::HookContext;
use crate::error::{TestError, TestOutcome};
use crate::invoker::InstanceBox;
use crate::scope::{ScopeChain, ScopeId};

/// Types of lifecycle hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookType {
    /// Run once before the first test of the scope
    SetupScope,
    /// Run once after the last test of the scope
    TeardownScope,
    /// Run before each test in the scope
    SetupMethod,
    /// Run after each test in the scope
    TeardownMethod,
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookType::SetupScope => write!(f, "setup_scope"),
            HookType::TeardownScope => write!(f, "teardown_scope"),
            HookType::SetupMethod => write!(f, "setup_method"),
            HookType::TeardownMethod => write!(f, "teardown_method"),
        }
    }
}

impl HookType {
    /// Check if this is a teardown hook
    pub fn is_teardown(&self) -> bool {
        matches!(self, HookType::TeardownScope | HookType::TeardownMethod)
    }

    /// Check if this is a setup hook
    pub fn is_setup(&self) -> bool {
        !self.is_teardown()
    }

    /// Check if this hook runs around every test rather than once per scope
    pub fn is_per_test(&self) -> bool {
        matches!(self, HookType::SetupMethod | HookType::TeardownMethod)
    }
}

/// A declared hook
#[derive(Debug, Clone, PartialEq)]
pub struct HookDescriptor {
    pub name: String,
    pub hook_type: HookType,
    pub scope: ScopeId,
    /// Lower runs first within one scope
    pub order: i32,
    pub timeout: Option<Duration>,
    seq: usize,
}

impl HookDescriptor {
    pub fn new(name: impl Into<String>, hook_type: HookType, scope: ScopeId) -> Self {
        Self {
            name: name.into(),
            hook_type,
            scope,
            order: 0,
            timeout: None,
            seq: 0,
        }
    }

    pub fn setup(scope: ScopeId, name: impl Into<String>) -> Self {
        Self::new(name, HookType::SetupScope, scope)
    }

    pub fn teardown(scope: ScopeId, name: impl Into<String>) -> Self {
        Self::new(name, HookType::TeardownScope, scope)
    }

    pub fn setup_method(scope: ScopeId, name: impl Into<String>) -> Self {
        Self::new(name, HookType::SetupMethod, scope)
    }

    pub fn teardown_method(scope: ScopeId, name: impl Into<String>) -> Self {
        Self::new(name, HookType::TeardownMethod, scope)
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Per-test hooks declared on a class receive the test instance
    pub fn receives_instance(&self) -> bool {
        self.hook_type.is_per_test() && self.scope.is_class()
    }
}

/// Runs hooks
#[async_trait]
pub trait HookInvoker: Send + Sync {
    async fn invoke_hook(
        &self,
        hook: &HookDescriptor,
        instance: Option<&mut InstanceBox>,
        ctx: &HookContext,
    ) -> TestOutcome;
}

type HookFn = Arc<dyn Fn(HookContext) -> BoxFuture<'static, TestOutcome> + Send + Sync>;

struct RegisteredHook {
    descriptor: HookDescriptor,
    action: Option<HookFn>,
}

/// Registry of declared hooks
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<RegisteredHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a hook run by an external [`HookInvoker`]
    pub fn declare(&mut self, descriptor: HookDescriptor) {
        self.push(descriptor, None);
    }

    /// Register a hook together with the closure that runs it
    pub fn register<F, Fut>(&mut self, descriptor: HookDescriptor, action: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        let action: HookFn = Arc::new(move |ctx| action(ctx).boxed());
        self.push(descriptor, Some(action));
    }

    /// Builder-style [`HookRegistry::register`]
    pub fn with_hook<F, Fut>(mut self, descriptor: HookDescriptor, action: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        self.register(descriptor, action);
        self
    }

    fn push(&mut self, mut descriptor: HookDescriptor, action: Option<HookFn>) {
        descriptor.seq = self.hooks.len();
        self.hooks.push(RegisteredHook { descriptor, action });
    }

    /// Hooks of one type declared on exactly `scope`, by order then registration
    pub fn scope_hooks(&self, scope: &ScopeId, hook_type: HookType) -> Vec<HookDescriptor> {
        let mut hooks: Vec<HookDescriptor> = self
            .hooks
            .iter()
            .map(|h| &h.descriptor)
            .filter(|d| d.hook_type == hook_type && &d.scope == scope)
            .cloned()
            .collect();
        hooks.sort_by_key(|d| (d.order, d.seq));
        hooks
    }

    /// Per-test hooks for a test in `chain`.
    ///
    /// Setup hooks run outermost scope first, teardown hooks innermost first.
    pub fn method_hooks(&self, chain: &ScopeChain, hook_type: HookType) -> Vec<HookDescriptor> {
        let scopes: Vec<&ScopeId> = if hook_type.is_setup() {
            chain.root_to_leaf().collect()
        } else {
            chain.leaf_to_root().collect()
        };
        scopes
            .into_iter()
            .flat_map(|scope| self.scope_hooks(scope, hook_type))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl HookInvoker for HookRegistry {
    async fn invoke_hook(
        &self,
        hook: &HookDescriptor,
        _instance: Option<&mut InstanceBox>,
        ctx: &HookContext,
    ) -> TestOutcome {
        let action = self
            .hooks
            .get(hook.seq)
            .filter(|h| h.descriptor.name == hook.name)
            .and_then(|h| h.action.clone())
            .ok_or_else(|| TestError::hook(&hook.name, "no action registered for hook"))?;
        action(ctx.clone()).await
    }
}
