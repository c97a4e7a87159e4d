//! Result sinks and run reports

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::executable::{ExecutableTest, TestResult, TestStatus};

/// Receives terminal results as tests finish
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Called exactly once per test, when it reaches a terminal state
    async fn report(&self, test: &ExecutableTest, result: &TestResult);

    /// Called once after the last test
    async fn on_run_finished(&self, _summary: &RunSummary) {}
}

/// Counts per terminal status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    /// Wall-clock duration of the whole run
    pub duration: Duration,
}

impl RunSummary {
    pub fn from_results(results: &[TestResult], duration: Duration) -> Self {
        let mut summary = Self {
            total: results.len(),
            duration,
            ..Self::default()
        };
        for result in results {
            match result.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed => summary.failed += 1,
                TestStatus::Skipped => summary.skipped += 1,
                TestStatus::Timeout => summary.timed_out += 1,
                TestStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Check if all tests passed (skips do not count against the run)
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.timed_out == 0 && self.cancelled == 0
    }

    /// Passed over executed tests (0.0 - 1.0)
    pub fn pass_rate(&self) -> f64 {
        let executed = self.total - self.skipped;
        if executed == 0 {
            return 1.0;
        }
        self.passed as f64 / executed as f64
    }

    /// Process exit code for this run
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }
}

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReportFormat {
    /// Colored terminal output
    #[default]
    Console,
    /// Machine-parseable JSON
    Json,
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportFormat::Console => write!(f, "console"),
            ReportFormat::Json => write!(f, "json"),
        }
    }
}

/// Full run report with all results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub suite_name: String,
    /// Report generation timestamp (RFC 3339)
    pub generated_at: String,
    pub summary: RunSummary,
    pub results: Vec<TestResult>,
}

impl TestReport {
    pub fn new(suite_name: impl Into<String>, results: Vec<TestResult>, summary: RunSummary) -> Self {
        Self {
            suite_name: suite_name.into(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            summary,
            results,
        }
    }

    /// Results that count against the run
    pub fn failed_results(&self) -> Vec<&TestResult> {
        self.results
            .iter()
            .filter(|r| !matches!(r.status, TestStatus::Passed | TestStatus::Skipped))
            .collect()
    }

    pub fn render(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Console => self.render_console(),
            ReportFormat::Json => self.render_json(),
        }
    }

    fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
    }

    fn render_console(&self) -> String {
        let mut output = String::new();

        // ANSI color codes
        const RESET: &str = "\x1b[0m";
        const BOLD: &str = "\x1b[1m";
        const GREEN: &str = "\x1b[32m";
        const RED: &str = "\x1b[31m";
        const YELLOW: &str = "\x1b[33m";
        const CYAN: &str = "\x1b[36m";
        const DIM: &str = "\x1b[2m";

        let summary = &self.summary;
        let (status_color, status_text) = if summary.all_passed() {
            (GREEN, "PASSED")
        } else {
            (RED, "FAILED")
        };
        let _ = writeln!(
            output,
            "\n{}{}=== Test Report: {} ==={}",
            BOLD, status_color, self.suite_name, RESET
        );
        let _ = writeln!(
            output,
            "{}Status: {}{}{}  |  Duration: {:.2}s{}",
            DIM,
            status_color,
            status_text,
            DIM,
            summary.duration.as_secs_f64(),
            RESET
        );

        let _ = writeln!(output);
        let _ = writeln!(output, "{}{}Summary:{}", BOLD, CYAN, RESET);
        let _ = writeln!(
            output,
            "  {}✓ Passed: {}{}  {}✗ Failed: {}{}  {}⏱ Timeout: {}{}  {}⊘ Skipped: {}{}  {}- Cancelled: {}{}",
            GREEN, summary.passed, RESET,
            RED, summary.failed, RESET,
            RED, summary.timed_out, RESET,
            YELLOW, summary.skipped, RESET,
            DIM, summary.cancelled, RESET
        );

        let _ = writeln!(output);
        let _ = writeln!(output, "{}{}Test Results:{}", BOLD, CYAN, RESET);
        for result in &self.results {
            let (icon, color) = match result.status {
                TestStatus::Passed => ("✓", GREEN),
                TestStatus::Failed => ("✗", RED),
                TestStatus::Timeout => ("⏱", RED),
                TestStatus::Skipped => ("⊘", YELLOW),
                TestStatus::Cancelled => ("-", DIM),
            };
            let _ = writeln!(
                output,
                "  {}{} {}{}  {}{}ms{}",
                color,
                icon,
                result.test_id,
                RESET,
                DIM,
                result.duration.as_millis(),
                RESET
            );
            if let Some(error) = &result.error {
                let _ = writeln!(output, "    {}→ {}{}", DIM, error, RESET);
            }
        }

        let _ = writeln!(output);
        let _ = writeln!(output, "{}{}{}", DIM, "─".repeat(40), RESET);
        let _ = writeln!(
            output,
            "{}Total: {} tests  |  Pass rate: {:.1}%{}",
            DIM,
            summary.total,
            summary.pass_rate() * 100.0,
            RESET
        );

        output
    }
}

/// Keeps every reported result in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    results: Mutex<Vec<TestResult>>,
    summary: Mutex<Option<RunSummary>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results in reporting order
    pub fn results(&self) -> Vec<TestResult> {
        self.results.lock().clone()
    }

    pub fn result(&self, test_id: &str) -> Option<TestResult> {
        self.results.lock().iter().find(|r| r.test_id == test_id).cloned()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.summary.lock().clone()
    }
}

#[async_trait]
impl ResultSink for CollectingSink {
    async fn report(&self, _test: &ExecutableTest, result: &TestResult) {
        self.results.lock().push(result.clone());
    }

    async fn on_run_finished(&self, summary: &RunSummary) {
        *self.summary.lock() = Some(summary.clone());
    }
}

/// Reports results through tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn report(&self, test: &ExecutableTest, result: &TestResult) {
        let duration_ms = result.duration.as_millis() as u64;
        match result.status {
            TestStatus::Passed | TestStatus::Skipped => info!(
                test_id = %test.id(),
                status = %result.status,
                duration_ms,
                attempts = result.attempts,
                "test finished"
            ),
            _ => warn!(
                test_id = %test.id(),
                status = %result.status,
                duration_ms,
                attempts = result.attempts,
                error = %result.error_message().unwrap_or_default(),
                "test did not pass"
            ),
        }
    }

    async fn on_run_finished(&self, summary: &RunSummary) {
        info!(
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            timed_out = summary.timed_out,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            duration_ms = summary.duration.as_millis() as u64,
            "run finished"
        );
    }
}

/// Fans every call out to several sinks, in order
#[derive(Default, Clone)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl ResultSink for MultiSink {
    async fn report(&self, test: &ExecutableTest, result: &TestResult) {
        for sink in &self.sinks {
            sink.report(test, result).await;
        }
    }

    async fn on_run_finished(&self, summary: &RunSummary) {
        for sink in &self.sinks {
            sink.on_run_finished(summary).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TestError;
    use crate::invoker::FnInvoker;
    use crate::metadata::{ClassInfo, InvokerBinding, TestMetadata};

    fn make(method: &str) -> ExecutableTest {
        let invoker = Arc::new(FnInvoker::stateless(|_a, _c| async { Ok(()) }));
        let meta = Arc::new(TestMetadata::new(ClassInfo::new("Rep"), method, InvokerBinding::Direct(invoker)));
        ExecutableTest::new(meta.id.clone(), meta.method_name.clone(), meta, vec![], vec![], vec![], None)
    }

    fn results() -> Vec<TestResult> {
        let ok = make("ok");
        let bad = make("bad");
        let slow = make("slow");
        let later = make("later");
        vec![
            TestResult::finished(&ok, TestStatus::Passed, None, chrono::Utc::now(), Duration::from_millis(3), 1),
            TestResult::not_run(&bad, TestError::assertion("expected 1, got 2")),
            TestResult::not_run(&slow, TestError::Timeout(Duration::from_millis(100))),
            TestResult::skipped(&later, "not today"),
        ]
    }

    #[test]
    fn test_summary_counts() {
        let summary = RunSummary::from_results(&results(), Duration::from_secs(1));
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!summary.all_passed());
        assert_eq!(summary.exit_code(), 1);
        assert!((summary.pass_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_run_passes() {
        let summary = RunSummary::from_results(&[], Duration::ZERO);
        assert!(summary.all_passed());
        assert_eq!(summary.pass_rate(), 1.0);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_console_report() {
        let results = results();
        let summary = RunSummary::from_results(&results, Duration::from_millis(1500));
        let report = TestReport::new("unit", results, summary);
        let text = report.render(ReportFormat::Console);

        assert!(text.contains("Test Report: unit"));
        assert!(text.contains("FAILED"));
        assert!(text.contains("Rep.bad"));
        assert!(text.contains("expected 1, got 2"));
        assert_eq!(report.failed_results().len(), 2);
    }

    #[test]
    fn test_json_report() {
        let results = results();
        let summary = RunSummary::from_results(&results, Duration::ZERO);
        let json = TestReport::new("unit", results, summary).render(ReportFormat::Json);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["timed_out"], 1);
        assert_eq!(value["results"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_multi_sink_fans_out() {
        let first = Arc::new(CollectingSink::new());
        let second = Arc::new(CollectingSink::new());
        let sink = MultiSink::new().with(first.clone()).with(second.clone()).with(Arc::new(LogSink));
        assert_eq!(sink.len(), 3);

        let test = make("ok");
        let result = TestResult::skipped(&test, "n/a");
        sink.report(&test, &result).await;
        sink.on_run_finished(&RunSummary::from_results(&[result], Duration::ZERO)).await;

        assert_eq!(first.results().len(), 1);
        assert_eq!(second.result("Rep.ok").unwrap().status, TestStatus::Skipped);
        assert_eq!(second.summary().unwrap().skipped, 1);
    }
}
