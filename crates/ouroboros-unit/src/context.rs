//! Contexts handed to test bodies and hooks

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::capture::OutputCapture;
use crate::error::TestError;
use crate::scope::ScopeId;
use crate::value::ArgValue;

/// What a running test body can see about itself
#[derive(Debug, Clone)]
pub struct TestContext {
    pub test_id: String,
    pub display_name: String,
    pub class_name: String,
    /// 1-based attempt number
    pub attempt: u32,
    properties: Arc<Vec<(String, ArgValue)>>,
    token: CancellationToken,
    output: OutputCapture,
}

impl TestContext {
    pub(crate) fn new(
        test_id: impl Into<String>,
        display_name: impl Into<String>,
        class_name: impl Into<String>,
        attempt: u32,
        properties: Arc<Vec<(String, ArgValue)>>,
        token: CancellationToken,
        output: OutputCapture,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            display_name: display_name.into(),
            class_name: class_name.into(),
            attempt,
            properties,
            token,
            output,
        }
    }

    /// Token cancelled when this attempt times out or the run is cancelled
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the attempt is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Injected property value by name
    pub fn property(&self, name: &str) -> Option<&ArgValue> {
        self.properties.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn properties(&self) -> &[(String, ArgValue)] {
        &self.properties
    }

    pub fn write_stdout(&self, text: &str) {
        self.output.write_stdout(text);
    }

    pub fn write_stderr(&self, text: &str) {
        self.output.write_stderr(text);
    }

    /// Error that ends the test as Skipped
    pub fn skip(&self, reason: impl Into<String>) -> TestError {
        TestError::Skipped(reason.into())
    }
}

/// What a hook can see about the scope it runs for
#[derive(Debug, Clone)]
pub struct HookContext {
    pub hook_name: String,
    pub scope: ScopeId,
    /// Set for per-test hooks
    pub test_id: Option<String>,
    token: CancellationToken,
}

impl HookContext {
    pub(crate) fn new(
        hook_name: impl Into<String>,
        scope: ScopeId,
        test_id: Option<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            hook_name: hook_name.into(),
            scope,
            test_id,
            token,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
