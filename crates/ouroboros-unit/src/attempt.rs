//! One attempt of a test body
//!
//! Each attempt owns a single cancellation scope (a child of the run token)
//! and moves through `Pending -> Running -> {Completed, TimedOut, Cancelled,
//! Faulted}`. The body is raced against the run token and the timeout timer,
//! so a per-test timeout and a run-wide cancellation are reported
//! differently.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{TestError, TestOutcome};

/// Phase of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptPhase {
    Pending,
    Running,
    /// Body returned successfully
    Completed,
    /// Timer fired before the body finished
    TimedOut,
    /// Run was cancelled, or the body reported cancellation
    Cancelled,
    /// Body returned an error or panicked
    Faulted,
}

impl AttemptPhase {
    pub fn is_finished(&self) -> bool {
        !matches!(self, AttemptPhase::Pending | AttemptPhase::Running)
    }
}

enum Race {
    Finished(std::thread::Result<TestOutcome>),
    TimedOut(Duration),
    Cancelled,
}

/// Cancellation and timeout scope of one attempt
#[derive(Debug)]
pub struct AttemptScope {
    phase: AttemptPhase,
    run_token: CancellationToken,
    token: CancellationToken,
    timeout: Option<Duration>,
}

impl AttemptScope {
    pub fn new(run_token: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            phase: AttemptPhase::Pending,
            run_token: run_token.clone(),
            token: run_token.child_token(),
            timeout,
        }
    }

    /// Token handed to the body; cancelled on timeout or run cancellation
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    /// Run `body` to a finished phase
    pub async fn run<F>(&mut self, body: F) -> TestOutcome
    where
        F: Future<Output = TestOutcome>,
    {
        if self.phase != AttemptPhase::Pending {
            return Err(TestError::Other(format!(
                "attempt already {:?}",
                self.phase
            )));
        }
        if self.run_token.is_cancelled() {
            self.phase = AttemptPhase::Cancelled;
            return Err(TestError::Cancelled);
        }
        self.phase = AttemptPhase::Running;

        let guarded = AssertUnwindSafe(body).catch_unwind();
        tokio::pin!(guarded);

        let race = match self.timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = self.run_token.cancelled() => Race::Cancelled,
                result = &mut guarded => Race::Finished(result),
                _ = tokio::time::sleep(limit) => Race::TimedOut(limit),
            },
            None => tokio::select! {
                biased;
                _ = self.run_token.cancelled() => Race::Cancelled,
                result = &mut guarded => Race::Finished(result),
            },
        };

        let (phase, outcome) = match race {
            Race::Finished(Ok(Ok(()))) => (AttemptPhase::Completed, Ok(())),
            Race::Finished(Ok(Err(e))) if e.is_cancelled() => (AttemptPhase::Cancelled, Err(e)),
            Race::Finished(Ok(Err(e))) => (AttemptPhase::Faulted, Err(e)),
            Race::Finished(Err(payload)) => (
                AttemptPhase::Faulted,
                Err(TestError::Panicked(panic_message(payload.as_ref()))),
            ),
            Race::TimedOut(limit) => (AttemptPhase::TimedOut, Err(TestError::Timeout(limit))),
            Race::Cancelled => (AttemptPhase::Cancelled, Err(TestError::Cancelled)),
        };

        self.phase = phase;
        self.token.cancel();
        outcome
    }
}

/// Await `future`, turning a panic into [`TestError::Panicked`]
pub(crate) async fn catch_panic<T, F>(future: F) -> Result<T, TestError>
where
    F: Future<Output = Result<T, TestError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(TestError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
