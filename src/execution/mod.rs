#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Running a submission's unit tests.
//!
//! The pipeline only sees the [`ExecutionClient`] trait. [`pytest::PytestRunner`]
//! is the bundled implementation; a sandbox is plugged in either by wrapping
//! the runner command ([`IsolationMode::Sandboxed`]) or by implementing the
//! trait directly.

/// Local pytest runner.
pub mod pytest;

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::submission::Submission;

/// Result of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Assertions held.
    Passed,
    /// An assertion failed.
    Failed,
    /// The test could not run (collection or fixture error).
    Error,
    /// The test was skipped.
    Skipped,
}

/// Resource limit a test ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitViolation {
    /// Exceeded its time budget.
    Timeout,
    /// Exceeded its memory budget.
    Memory,
}

/// Outcome of one test for one submission.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(on(String, into))]
pub struct TestOutcome {
    /// Test identifier as reported by the runner.
    pub test_id:       String,
    /// Pass/fail status.
    pub status:        TestStatus,
    /// Captured diagnostic text.
    #[builder(default)]
    #[serde(default)]
    pub diagnostic:    String,
    /// Wall-clock duration.
    #[builder(default)]
    #[serde(default)]
    pub duration_secs: f64,
    /// Resource limit violation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation:     Option<LimitViolation>,
}

impl TestOutcome {
    /// A test passes only if it passed without hitting a limit.
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed && self.violation.is_none()
    }

    /// Whether the outcome earns its points. Skipped tests, including
    /// expected failures, are not held against the submission.
    pub fn satisfied(&self) -> bool {
        self.passed() || (self.status == TestStatus::Skipped && self.violation.is_none())
    }
}

/// Shared test suite copied into each submission before running.
#[derive(Debug, Clone, Default)]
pub struct TestSuite {
    /// Directory of test files.
    pub tests_dir: Option<PathBuf>,
    /// Directory of data files the tests read.
    pub data_dir:  Option<PathBuf>,
}

/// Where student code runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IsolationMode {
    /// Directly on the host.
    #[default]
    Local,
    /// Inside a sandbox; `wrapper` is prepended to the runner command, e.g.
    /// `["firejail", "--quiet", "--net=none"]`.
    Sandboxed {
        /// Command prefix.
        wrapper: Vec<String>,
    },
}

/// Limits for one run of a submission's tests.
#[derive(Debug, Clone, Builder)]
pub struct RunOptions {
    /// Runner deadline.
    #[builder(default = Duration::from_secs(120))]
    pub timeout:         Duration,
    /// Memory limit in MiB, enforced by the runner.
    pub memory_limit_mb: Option<u64>,
    /// Isolation mode; does not change the output.
    #[builder(default)]
    pub isolation:       IsolationMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Whole-run failures of the execution client.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The runner did not finish before its deadline.
    #[error("test run timed out after {0:?}")]
    Timeout(Duration),
    /// The runner produced no results at all.
    #[error("test runner crashed: {0}")]
    Crash(String),
}

/// Runs a submission's tests and reports one outcome per test.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Executes `suite` against `submission`. Never retried by the caller.
    async fn run_tests(
        &self,
        submission: &Submission,
        suite: &TestSuite,
        options: &RunOptions,
    ) -> Result<Vec<TestOutcome>, ExecutionError>;
}

/// One-line tally such as `3 passed, 1 failed (1 timeout)`.
pub fn render_summary(outcomes: &[TestOutcome]) -> String {
    let count = |status| outcomes.iter().filter(|o| o.status == status).count();
    let timeouts = outcomes
        .iter()
        .filter(|o| o.violation == Some(LimitViolation::Timeout))
        .count();

    let mut summary = format!(
        "{} passed, {} failed",
        count(TestStatus::Passed),
        count(TestStatus::Failed) + count(TestStatus::Error)
    );
    let skipped = count(TestStatus::Skipped);
    if skipped > 0 {
        summary.push_str(&format!(", {skipped} skipped"));
    }
    if timeouts > 0 {
        summary.push_str(&format!(" ({timeouts} timeout)"));
    }
    summary
}
