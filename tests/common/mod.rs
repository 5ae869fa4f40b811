#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use graderpod::{
    execution::{
        ExecutionClient, ExecutionError, RunOptions, TestOutcome, TestStatus, TestSuite,
    },
    grade::{GradeRecord, SubmissionWorkflow},
    pipeline::{CancelSignal, PersistenceError, RecordStore},
    review::{
        FigureRequest, ReviewClient, ReviewError, ReviewRequest, ReviewScore,
        retry::{RetryPolicy, ReviewGate},
    },
    rubric::{Criterion, GradingMode, Rubric},
    submission::Submission,
};

/// What the fake runner does for one student.
#[derive(Debug, Clone)]
pub enum Run {
    /// Report these `(test, passed)` pairs.
    Report(Vec<(&'static str, bool)>),
    /// Fail with a crash.
    Crash(&'static str),
    /// Fail with a runner timeout.
    Timeout(Duration),
    /// Panic inside the call.
    Panic,
    /// Never return.
    Hang,
}

/// Scripted execution client.
pub struct FakeExecutor {
    default:   Run,
    per_id:    HashMap<String, Run>,
    delay:     Duration,
    cancel_on: Option<CancelSignal>,
    pub calls: AtomicUsize,
    active:    AtomicUsize,
    pub peak:  AtomicUsize,
}

impl FakeExecutor {
    pub fn new(default: Run) -> Self {
        Self {
            default,
            per_id: HashMap::new(),
            delay: Duration::ZERO,
            cancel_on: None,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, student: &str, run: Run) -> Self {
        self.per_id.insert(student.to_string(), run);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fires `signal` from inside the first call.
    pub fn cancelling(mut self, signal: CancelSignal) -> Self {
        self.cancel_on = Some(signal);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionClient for FakeExecutor {
    async fn run_tests(
        &self,
        submission: &Submission,
        _suite: &TestSuite,
        _options: &RunOptions,
    ) -> Result<Vec<TestOutcome>, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(signal) = &self.cancel_on {
            signal.cancel();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let run = self
            .per_id
            .get(&submission.student_id)
            .unwrap_or(&self.default)
            .clone();
        match run {
            Run::Report(tests) => Ok(tests
                .into_iter()
                .map(|(id, passed)| {
                    TestOutcome::builder()
                        .test_id(format!("tests/test_answers.py::{id}"))
                        .status(if passed {
                            TestStatus::Passed
                        } else {
                            TestStatus::Failed
                        })
                        .build()
                })
                .collect()),
            Run::Crash(msg) => Err(ExecutionError::Crash(msg.to_string())),
            Run::Timeout(limit) => Err(ExecutionError::Timeout(limit)),
            Run::Panic => panic!("runner exploded for {}", submission.student_id),
            Run::Hang => std::future::pending().await,
        }
    }
}

/// What the fake reviewer does for one criterion.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Award points with feedback.
    Award(f64, &'static str),
    /// Fail every attempt with this error.
    Fail(ReviewError),
    /// Never answer.
    Hang,
}

/// Scripted review client.
pub struct FakeReviewer {
    default:        Verdict,
    per_criterion:  HashMap<String, Verdict>,
    delay:          Duration,
    pub calls:      AtomicUsize,
    active:         AtomicUsize,
    pub peak:       AtomicUsize,
    criterion_hits: Mutex<HashMap<String, usize>>,
    artifacts:      Mutex<HashMap<String, String>>,
    pub figures:    AtomicUsize,
}

impl FakeReviewer {
    pub fn new(default: Verdict) -> Self {
        Self {
            default,
            per_criterion: HashMap::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            criterion_hits: Mutex::new(HashMap::new()),
            artifacts: Mutex::new(HashMap::new()),
            figures: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, criterion: &str, verdict: Verdict) -> Self {
        self.per_criterion.insert(criterion.to_string(), verdict);
        self
    }

    /// Each review takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, criterion: &str) -> usize {
        self.criterion_hits
            .lock()
            .expect("lock")
            .get(criterion)
            .copied()
            .unwrap_or_default()
    }

    /// Most concurrent reviews seen at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Artifact text last sent for `criterion`.
    pub fn artifact_for(&self, criterion: &str) -> Option<String> {
        self.artifacts.lock().expect("lock").get(criterion).cloned()
    }

    pub fn figure_calls(&self) -> usize {
        self.figures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReviewClient for FakeReviewer {
    async fn score(&self, request: &ReviewRequest) -> Result<ReviewScore, ReviewError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .criterion_hits
            .lock()
            .expect("lock")
            .entry(request.criterion.id.clone())
            .or_default() += 1;
        self.artifacts
            .lock()
            .expect("lock")
            .insert(request.criterion.id.clone(), request.artifact_text.clone());

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let verdict = self
            .per_criterion
            .get(&request.criterion.id)
            .unwrap_or(&self.default)
            .clone();
        match verdict {
            Verdict::Award(awarded, feedback) => Ok(ReviewScore {
                awarded,
                feedback: feedback.to_string(),
                confidence: Some(0.9),
                model: "fake-model".to_string(),
                raw_response: format!("{{\"awarded\": {awarded}}}"),
            }),
            Verdict::Fail(e) => Err(e),
            Verdict::Hang => std::future::pending().await,
        }
    }

    async fn describe_figure(&self, request: &FigureRequest) -> Result<String, ReviewError> {
        self.figures.fetch_add(1, Ordering::SeqCst);
        let name = request
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("{name} plots {} against time", request.caption))
    }
}

/// Record store kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    records:    Mutex<HashMap<(String, String), GradeRecord>>,
    fail_saves: bool,
    pub saves:  AtomicUsize,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self, rubric_version: &str) -> Result<Vec<GradeRecord>, PersistenceError> {
        let mut records: Vec<GradeRecord> = self
            .records
            .lock()
            .expect("lock")
            .values()
            .filter(|r| r.rubric_version == rubric_version)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.submission_id.cmp(&b.submission_id));
        Ok(records)
    }

    async fn save(&self, record: &GradeRecord) -> Result<(), PersistenceError> {
        if self.fail_saves {
            return Err(PersistenceError::Write {
                path:   format!("memory/{}", record.submission_id).into(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.records.lock().expect("lock").insert(
            (record.rubric_version.clone(), record.submission_id.clone()),
            record.clone(),
        );
        Ok(())
    }
}

/// Creates a submission folder with code and a short report.
pub fn submission(dir: &Path, id: &str) -> Submission {
    let root = dir.join(id);
    std::fs::create_dir_all(&root).expect("create submission");
    let code = root.join("answers.py");
    let report = root.join("report.md");
    std::fs::write(&code, "def mean(xs):\n    return sum(xs) / len(xs)\n").expect("write code");
    std::fs::write(&report, "# Report\n\nThe mean of the column is 42.\n").expect("write report");

    Submission::builder()
        .student_id(id)
        .root(root)
        .code_path(code)
        .report_path(report)
        .build()
}

/// Creates a submission whose report embeds `figure` (written to disk) and
/// links to `missing` (not written).
pub fn submission_with_figures(dir: &Path, id: &str, figure: &str, missing: &str) -> Submission {
    let submission = submission(dir, id);
    std::fs::write(submission.root.join(figure), b"\x89PNG").expect("write figure");
    let report = format!(
        "# Report\n\n![Monthly sales]({figure})\n\n![Residuals]({missing})\n"
    );
    std::fs::write(submission.root.join("report.md"), report).expect("write report");
    submission
}

/// Creates one submission folder per id.
pub fn submissions(dir: &Path, ids: &[&str]) -> Vec<Submission> {
    ids.iter().map(|id| submission(dir, id)).collect()
}

/// A test-graded criterion over `tests`.
pub fn test_criterion(id: &str, max_points: f64, tests: &[&str]) -> Criterion {
    Criterion::builder()
        .id(id)
        .max_points(max_points)
        .mode(GradingMode::Test)
        .tests(tests.iter().map(|t| (*t).into()).collect())
        .build()
}

/// An LLM-graded criterion.
pub fn llm_criterion(id: &str, max_points: f64) -> Criterion {
    Criterion::builder()
        .id(id)
        .description(format!("Discussion for {id}"))
        .max_points(max_points)
        .mode(GradingMode::Llm)
        .build()
}

/// A hybrid criterion over `tests` with the default gated rule.
pub fn hybrid_criterion(id: &str, max_points: f64, tests: &[&str]) -> Criterion {
    Criterion::builder()
        .id(id)
        .max_points(max_points)
        .mode(GradingMode::Hybrid)
        .tests(tests.iter().map(|t| (*t).into()).collect())
        .build()
}

/// A rubric whose total is the sum of its non-extra criteria.
pub fn rubric(criteria: Vec<Criterion>) -> Rubric {
    let total = criteria
        .iter()
        .filter(|c| !c.extra_credit)
        .map(|c| c.max_points)
        .sum();
    Rubric::builder()
        .title("Lab 1")
        .total_points(total)
        .criteria(criteria)
        .build()
}

/// Short timeouts so paused-clock tests finish instantly.
pub fn fast_policy(retries: u32) -> RetryPolicy {
    RetryPolicy {
        retries,
        timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(10),
    }
}

/// Workflow over the fakes; `reviewer: None` grades with tests only.
pub fn workflow(
    executor: Arc<FakeExecutor>,
    reviewer: Option<Arc<FakeReviewer>>,
    policy: RetryPolicy,
) -> SubmissionWorkflow {
    workflow_with_review_bound(executor, reviewer, policy, 2)
}

/// Like [`workflow`], allowing `review_bound` reviews in flight at once.
pub fn workflow_with_review_bound(
    executor: Arc<FakeExecutor>,
    reviewer: Option<Arc<FakeReviewer>>,
    policy: RetryPolicy,
    review_bound: usize,
) -> SubmissionWorkflow {
    let skip_llm = reviewer.is_none();
    let reviews = reviewer.map(|r| {
        let client: Arc<dyn ReviewClient> = r;
        ReviewGate::new(client, review_bound, policy)
    });
    let executor: Arc<dyn ExecutionClient> = executor;

    SubmissionWorkflow::builder()
        .executor(executor)
        .maybe_reviews(reviews)
        .skip_llm(skip_llm)
        .build()
}
