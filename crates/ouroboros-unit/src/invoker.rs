//! Test instances and invokers
//!
//! A [`TestInvoker`] creates an instance of a test class and calls a test
//! method on it. [`FnInvoker`] is the closure-backed invoker used when tests
//! are registered in code; the [`InvokerRegistry`] holds invokers looked up
//! by name.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::context::TestContext;
use crate::error::{TestError, TestOutcome};
use crate::value::ArgValue;

/// A live test class instance
#[async_trait]
pub trait TestInstance: Send + Sync {
    /// Inject a property resolved from a property data source
    fn set_property(&mut self, name: &str, value: ArgValue) -> TestOutcome {
        let _ = (name, value);
        Ok(())
    }

    /// Release the instance's resources
    async fn dispose(&mut self) -> TestOutcome {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Owned test instance
pub type InstanceBox = Box<dyn TestInstance>;

/// Creates test instances and invokes test methods on them
#[async_trait]
pub trait TestInvoker: Send + Sync {
    async fn create_instance(&self, class_args: &[ArgValue]) -> Result<InstanceBox, TestError>;

    async fn invoke(
        &self,
        instance: &mut InstanceBox,
        args: &[ArgValue],
        ctx: &TestContext,
    ) -> TestOutcome;
}

type Factory<S> = Arc<dyn Fn(&[ArgValue]) -> Result<S, TestError> + Send + Sync>;
type Body<S> = Arc<dyn Fn(Arc<S>, Vec<ArgValue>, TestContext) -> BoxFuture<'static, TestOutcome> + Send + Sync>;
type Disposer<S> = Arc<dyn Fn(Arc<S>) -> BoxFuture<'static, TestOutcome> + Send + Sync>;

/// Closure-backed invoker.
///
/// The factory builds the per-instance state `S` from the class arguments;
/// the body receives that state shared behind an `Arc`.
pub struct FnInvoker<S> {
    factory: Factory<S>,
    body: Body<S>,
    disposer: Option<Disposer<S>>,
}

impl FnInvoker<()> {
    /// Invoker for a test without instance state
    pub fn stateless<F, Fut>(body: F) -> Self
    where
        F: Fn(Vec<ArgValue>, TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        Self {
            factory: Arc::new(|_| Ok(())),
            body: Arc::new(move |_, args, ctx| body(args, ctx).boxed()),
            disposer: None,
        }
    }
}

impl<S: Send + Sync + 'static> FnInvoker<S> {
    pub fn new<C, F, Fut>(factory: C, body: F) -> Self
    where
        C: Fn(&[ArgValue]) -> Result<S, TestError> + Send + Sync + 'static,
        F: Fn(Arc<S>, Vec<ArgValue>, TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        Self {
            factory: Arc::new(factory),
            body: Arc::new(move |state, args, ctx| body(state, args, ctx).boxed()),
            disposer: None,
        }
    }

    /// Run `disposer` when an instance is released
    pub fn on_dispose<D, Fut>(mut self, disposer: D) -> Self
    where
        D: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        self.disposer = Some(Arc::new(move |state| disposer(state).boxed()));
        self
    }
}

/// Instance created by an [`FnInvoker`]
pub struct FnInstance<S> {
    state: Arc<S>,
    properties: Vec<(String, ArgValue)>,
    disposer: Option<Disposer<S>>,
}

impl<S> FnInstance<S> {
    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    pub fn properties(&self) -> &[(String, ArgValue)] {
        &self.properties
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> TestInstance for FnInstance<S> {
    fn set_property(&mut self, name: &str, value: ArgValue) -> TestOutcome {
        self.properties.push((name.to_string(), value));
        Ok(())
    }

    async fn dispose(&mut self) -> TestOutcome {
        match &self.disposer {
            Some(disposer) => disposer(self.state.clone()).await,
            None => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> TestInvoker for FnInvoker<S> {
    async fn create_instance(&self, class_args: &[ArgValue]) -> Result<InstanceBox, TestError> {
        let state = (self.factory)(class_args)?;
        Ok(Box::new(FnInstance {
            state: Arc::new(state),
            properties: Vec::new(),
            disposer: self.disposer.clone(),
        }))
    }

    async fn invoke(
        &self,
        instance: &mut InstanceBox,
        args: &[ArgValue],
        ctx: &TestContext,
    ) -> TestOutcome {
        let state = instance
            .as_any()
            .downcast_ref::<FnInstance<S>>()
            .map(|i| i.state.clone())
            .ok_or_else(|| TestError::Instance("instance was not created by this invoker".to_string()))?;
        (self.body)(state, args.to_vec(), ctx.clone()).await
    }
}

/// Invokers looked up by name
#[derive(Default, Clone)]
pub struct InvokerRegistry {
    invokers: HashMap<String, Arc<dyn TestInvoker>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoker, replacing any previous one of the same name
    pub fn register(&mut self, name: impl Into<String>, invoker: Arc<dyn TestInvoker>) {
        self.invokers.insert(name.into(), invoker);
    }

    pub fn with(mut self, name: impl Into<String>, invoker: impl TestInvoker + 'static) -> Self {
        self.register(name, Arc::new(invoker));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TestInvoker>> {
        self.invokers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }
}
