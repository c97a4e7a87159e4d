//! Per-test output capture
//!
//! Each attempt runs inside its own [`OutputCapture`] scope (a tokio task
//! local), so concurrently running tests never see each other's output.
//! Code running inside a test writes through [`write_stdout`] /
//! [`write_stderr`] or the `test_println!` / `test_eprintln!` macros; outside
//! a capture scope the text goes to the real stdout/stderr.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT: OutputCapture;
}

#[derive(Debug, Default)]
struct Buffers {
    stdout: String,
    stderr: String,
}

/// Captured stdout/stderr of one test attempt
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    inner: Arc<Mutex<Buffers>>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_stdout(&self, text: &str) {
        self.inner.lock().stdout.push_str(text);
    }

    pub fn write_stderr(&self, text: &str) {
        self.inner.lock().stderr.push_str(text);
    }

    pub fn stdout(&self) -> String {
        self.inner.lock().stdout.clone()
    }

    pub fn stderr(&self) -> String {
        self.inner.lock().stderr.clone()
    }

    /// Run `fut` with this capture installed as the current one
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        CURRENT.scope(self.clone(), fut).await
    }
}

/// Write to the current test's stdout
pub fn write_stdout(text: &str) {
    if CURRENT.try_with(|c| c.write_stdout(text)).is_err() {
        print!("{}", text);
    }
}

/// Write to the current test's stderr
pub fn write_stderr(text: &str) {
    if CURRENT.try_with(|c| c.write_stderr(text)).is_err() {
        eprint!("{}", text);
    }
}

/// `println!` into the current test's captured stdout
#[macro_export]
macro_rules! test_println {
    () => { $crate::capture::write_stdout("\n") };
    ($($arg:tt)*) => {
        $crate::capture::write_stdout(&format!("{}\n", format_args!($($arg)*)))
    };
}

/// `eprintln!` into the current test's captured stderr
#[macro_export]
macro_rules! test_eprintln {
    () => { $crate::capture::write_stderr("\n") };
    ($($arg:tt)*) => {
        $crate::capture::write_stderr(&format!("{}\n", format_args!($($arg)*)))
    };
}
