#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::{
    collections::HashMap,
    ffi::OsString,
    path::PathBuf,
};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{
    ExecutionClient, ExecutionError, IsolationMode, LimitViolation, RunOptions, TestOutcome,
    TestStatus, TestSuite,
};
use crate::{
    constants::{ANSWERS_FILENAME, TEACHER_ANSWERS_FILENAME},
    process::{self, ProcessError},
    submission::Submission,
    util::{python_path, replace_dir},
};

/// Runs the shared pytest suite inside each submission folder.
#[derive(Debug, Clone, Default)]
pub struct PytestRunner {
    /// Interpreter to use; looked up on `PATH` when unset.
    python: Option<PathBuf>,
}

impl PytestRunner {
    /// Creates a runner using `python`, or the first interpreter on `PATH`.
    pub fn new(python: Option<PathBuf>) -> Self {
        Self { python }
    }

    /// Copies the suite into the submission and makes sure `answers.py`
    /// exists for the tests to import.
    fn stage(&self, submission: &Submission, suite: &TestSuite) -> Result<()> {
        if let Some(tests) = suite.tests_dir.as_deref().filter(|p| p.is_dir()) {
            replace_dir(tests, &submission.root.join("tests"))?;
        }
        if let Some(data) = suite.data_dir.as_deref().filter(|p| p.is_dir()) {
            let name = data
                .file_name()
                .context("test data directory has no name")?;
            replace_dir(data, &submission.root.join(name))?;
        }

        let answers = submission.root.join(ANSWERS_FILENAME);
        let teacher = submission.root.join(TEACHER_ANSWERS_FILENAME);
        if !answers.exists() && teacher.exists() {
            std::fs::copy(&teacher, &answers)
                .with_context(|| format!("Could not copy {}", teacher.display()))?;
        }
        Ok(())
    }

    /// Builds the program and argument list, honouring the isolation mode and
    /// memory limit.
    fn command(&self, options: &RunOptions) -> Result<(OsString, Vec<OsString>)> {
        let python = match &self.python {
            Some(p) => p.clone().into_os_string(),
            None => python_path()?,
        };

        let mut argv: Vec<OsString> = Vec::new();
        if let IsolationMode::Sandboxed { wrapper } = &options.isolation {
            argv.extend(wrapper.iter().map(OsString::from));
        }
        if let Some(mb) = options.memory_limit_mb {
            match which::which("prlimit") {
                Ok(prlimit) => {
                    argv.push(prlimit.into_os_string());
                    argv.push(format!("--as={}", mb * 1024 * 1024).into());
                }
                Err(_) => tracing::warn!("prlimit not found; memory limit of {mb} MiB not enforced"),
            }
        }
        argv.push(python);
        argv.extend(
            [
                "-m",
                "pytest",
                "tests/",
                "-v",
                "--tb=short",
                "-rA",
                "--durations=0",
                "-p",
                "no:cacheprovider",
            ]
            .into_iter()
            .map(OsString::from),
        );

        let program = argv.remove(0);
        Ok((program, argv))
    }
}

#[async_trait]
impl ExecutionClient for PytestRunner {
    async fn run_tests(
        &self,
        submission: &Submission,
        suite: &TestSuite,
        options: &RunOptions,
    ) -> Result<Vec<TestOutcome>, ExecutionError> {
        let crash = |e: anyhow::Error| ExecutionError::Crash(format!("{e:#}"));
        self.stage(submission, suite).map_err(crash)?;
        let (program, args) = self.command(options).map_err(crash)?;

        let mut pythonpath = submission.root.clone().into_os_string();
        if let Some(existing) = std::env::var_os("PYTHONPATH") {
            pythonpath.push(":");
            pythonpath.push(existing);
        }
        let env = [(OsString::from("PYTHONPATH"), pythonpath)];

        tracing::debug!(student = %submission.student_id, "running pytest");
        let collected = process::run_collect(
            &program,
            &args,
            Some(&submission.root),
            &env,
            Some(options.timeout),
        )
        .await
        .map_err(|e| match e {
            ProcessError::TimedOut(limit) => ExecutionError::Timeout(limit),
            other => ExecutionError::Crash(other.to_string()),
        })?;

        let output = collected.combined_output();
        let outcomes = parse_pytest_output(&output);
        if outcomes.is_empty() && !collected.status.success() {
            let tail: Vec<&str> = output.lines().rev().take(15).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(ExecutionError::Crash(format!(
                "pytest exited with {} and reported no tests:\n{}",
                collected.status,
                tail.join("\n")
            )));
        }

        Ok(outcomes)
    }
}

/// Maps a pytest status word to a [`TestStatus`].
fn status_word(word: &str) -> Option<TestStatus> {
    match word {
        "PASSED" | "XPASS" => Some(TestStatus::Passed),
        "FAILED" => Some(TestStatus::Failed),
        "ERROR" => Some(TestStatus::Error),
        // An expected failure is not held against the submission.
        "SKIPPED" | "XFAIL" => Some(TestStatus::Skipped),
        _ => None,
    }
}

/// Flags resource limits mentioned in a failure diagnostic.
fn violation_in(diagnostic: &str) -> Option<LimitViolation> {
    if diagnostic.contains("MemoryError") {
        Some(LimitViolation::Memory)
    } else if diagnostic.contains("Timeout >") || diagnostic.contains("TimeoutError") {
        Some(LimitViolation::Timeout)
    } else {
        None
    }
}

/// Returns the outcome for `node`, inserting it with `status` on first sight.
fn upsert<'a>(
    order: &mut Vec<String>,
    outcomes: &'a mut HashMap<String, TestOutcome>,
    node: &str,
    status: TestStatus,
) -> &'a mut TestOutcome {
    if !outcomes.contains_key(node) {
        order.push(node.to_string());
    }
    outcomes
        .entry(node.to_string())
        .or_insert_with(|| TestOutcome::builder().test_id(node).status(status).build())
}

/// Splits off the first whitespace-delimited word.
fn first_word(line: &str) -> Option<(&str, &str)> {
    line.trim_start()
        .split_once(char::is_whitespace)
        .map(|(word, rest)| (word, rest.trim_start()))
}

/// Splits `node - message` at the first ` - ` outside the node's
/// parametrization brackets.
fn split_summary(rest: &str) -> (&str, &str) {
    let mut depth = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ' ' if depth == 0 && rest[i..].starts_with(" - ") => {
                return (rest[..i].trim(), &rest[i + 3..]);
            }
            _ => {}
        }
    }
    (rest.trim(), "")
}

/// Drops a trailing progress marker such as `[ 50%]`.
fn strip_progress(line: &str) -> &str {
    match line.strip_suffix("%]").and_then(|rest| rest.rfind('[')) {
        Some(open) => line[..open].trim_end(),
        None => line,
    }
}

/// Parses `pytest -v -rA --durations=0` output into one outcome per test,
/// in the order tests were first reported.
///
/// Node ids may contain spaces (`test_x[a b]`), so the status is taken from
/// the last word of a progress line and the first word of a summary line.
pub fn parse_pytest_output(output: &str) -> Vec<TestOutcome> {
    let mut order: Vec<String> = Vec::new();
    let mut outcomes: HashMap<String, TestOutcome> = HashMap::new();
    let mut durations: Vec<(String, f64)> = Vec::new();

    for line in output.lines() {
        let line = line.trim();

        // `tests/test_a.py::test_x[a b] PASSED [ 50%]`
        if let Some((node, word)) = strip_progress(line).rsplit_once(char::is_whitespace)
            && let Some(status) = status_word(word)
        {
            let node = node.trim_end();
            if node.contains("::") {
                let outcome = upsert(&mut order, &mut outcomes, node, status);
                if status != TestStatus::Passed {
                    outcome.status = status;
                }
                continue;
            }
        }

        let Some((first, rest)) = first_word(line) else {
            continue;
        };

        // `FAILED tests/test_a.py::test_x - AssertionError: ...`
        if let Some(status) = status_word(first) {
            let (node, message) = split_summary(rest);
            if node.contains("::") {
                let outcome = upsert(&mut order, &mut outcomes, node, status);
                if status != TestStatus::Passed {
                    outcome.status = status;
                }
                let message = message.trim();
                if !message.is_empty() {
                    outcome.violation = outcome.violation.or(violation_in(message));
                    outcome.diagnostic = message.to_string();
                }
            }
            continue;
        }

        // `0.52s call     tests/test_a.py::test_x`
        if let Some(secs) = first.strip_suffix('s').and_then(|s| s.parse::<f64>().ok())
            && let Some((phase, node)) = first_word(rest)
            && matches!(phase, "call" | "setup" | "teardown")
            && !node.is_empty()
        {
            durations.push((node.trim_end().to_string(), secs));
        }
    }

    for (node, secs) in durations {
        if let Some(outcome) = outcomes.get_mut(&node) {
            outcome.duration_secs += secs;
        }
    }

    order
        .into_iter()
        .filter_map(|node| outcomes.remove(&node))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
============================= test session starts ==============================
collected 3 items

tests/test_answers.py::test_mean PASSED                                  [ 33%]
tests/test_answers.py::test_median FAILED                                [ 66%]
tests/test_answers.py::test_big[1000] FAILED                             [100%]

=================================== FAILURES ===================================
============================= slowest durations ================================
0.50s call     tests/test_answers.py::test_median
0.01s setup    tests/test_answers.py::test_median
0.20s call     tests/test_answers.py::test_mean
=========================== short test summary info ============================
PASSED tests/test_answers.py::test_mean
FAILED tests/test_answers.py::test_median - assert 2.5 == 3
FAILED tests/test_answers.py::test_big[1000] - MemoryError
========================= 1 passed, 2 failed in 0.71s ==========================
";

    #[test]
    fn parses_verbose_and_summary_lines() {
        let outcomes = parse_pytest_output(OUTPUT);

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].test_id, "tests/test_answers.py::test_mean");
        assert!(outcomes[0].passed());
        assert!((outcomes[0].duration_secs - 0.20).abs() < 1e-9);

        assert_eq!(outcomes[1].status, TestStatus::Failed);
        assert_eq!(outcomes[1].diagnostic, "assert 2.5 == 3");
        assert!((outcomes[1].duration_secs - 0.51).abs() < 1e-9);

        assert_eq!(outcomes[2].violation, Some(LimitViolation::Memory));
    }

    #[test]
    fn expected_failures_are_skipped_not_failed() {
        let output = "\
tests/test_answers.py::test_known_bug XFAIL                              [ 50%]
tests/test_answers.py::test_fixed_bug XPASS                              [100%]
XFAIL tests/test_answers.py::test_known_bug - rounding is not implemented yet
";
        let outcomes = parse_pytest_output(output);

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].status, TestStatus::Skipped);
        assert_eq!(outcomes[0].diagnostic, "rounding is not implemented yet");
        assert_eq!(outcomes[1].status, TestStatus::Passed);
    }

    #[test]
    fn parametrized_ids_may_contain_spaces() {
        let output = "\
tests/test_answers.py::test_label[New York] PASSED                       [ 50%]
tests/test_answers.py::test_label[Los Angeles - CA] FAILED               [100%]
0.30s call     tests/test_answers.py::test_label[New York]
FAILED tests/test_answers.py::test_label[Los Angeles - CA] - assert 'LA' == 'Los Angeles'
";
        let outcomes = parse_pytest_output(output);

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].test_id, "tests/test_answers.py::test_label[New York]");
        assert!(outcomes[0].passed());
        assert!((outcomes[0].duration_secs - 0.30).abs() < 1e-9);
        assert_eq!(
            outcomes[1].test_id,
            "tests/test_answers.py::test_label[Los Angeles - CA]"
        );
        assert_eq!(outcomes[1].status, TestStatus::Failed);
        assert_eq!(outcomes[1].diagnostic, "assert 'LA' == 'Los Angeles'");
    }

    #[test]
    fn collection_errors_yield_no_outcomes() {
        let output = "ERROR tests/test_answers.py - ModuleNotFoundError: No module named 'answers'\n\
                      1 error in 0.05s";
        assert!(parse_pytest_output(output).is_empty());
    }

    #[test]
    fn command_prefixes_sandbox_wrapper() {
        let runner = PytestRunner::new(Some(PathBuf::from("/usr/bin/python3")));
        let options = RunOptions::builder()
            .isolation(IsolationMode::Sandboxed {
                wrapper: vec!["firejail".into(), "--quiet".into()],
            })
            .build();

        let (program, args) = runner.command(&options).expect("command");
        assert_eq!(program, OsString::from("firejail"));
        assert_eq!(args[0], OsString::from("--quiet"));
        assert_eq!(args[1], OsString::from("/usr/bin/python3"));
        assert!(args.contains(&OsString::from("--tb=short")));
    }
}
