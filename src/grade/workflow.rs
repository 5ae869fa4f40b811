#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! The per-submission grading state machine.
//!
//! [`SubmissionWorkflow::grade`] loads a submission, runs its tests once,
//! fans out one review per LLM-graded criterion, waits for all of them, and
//! merges everything into a single [`GradeRecord`]. Expected failures become
//! [`GradeIssue`](super::GradeIssue)s on the record; the method itself never
//! fails.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bon::Builder;
use chrono::Utc;
use futures::future::join_all;
use tracing::Instrument;

use super::{
    error::GradeError,
    results::{CriterionScore, GradeRecord, GradeStatus, ReviewMeta, ScoreSource},
    scoring::{HybridPolicy, TestAward, clamp_points, test_fraction},
};
use crate::{
    execution::{
        ExecutionClient, ExecutionError, LimitViolation, RunOptions, TestOutcome, TestStatus,
        TestSuite, render_summary,
    },
    review::{
        FigureRequest, ReviewRequest, ReviewScore,
        retry::{ReviewFailure, ReviewGate},
    },
    rubric::{Artifact, Criterion, GradingMode, Rubric},
    submission::{Submission, SubmissionArtifacts},
};

/// Result of a review, with the number of calls it took.
type ReviewResult = Result<(ReviewScore, u32), ReviewFailure>;

/// Grades one submission against a rubric.
#[derive(Clone, Builder)]
pub struct SubmissionWorkflow {
    /// Runs the submission's tests.
    executor:        Arc<dyn ExecutionClient>,
    /// Shared, bounded review entry point; `None` disables LLM grading.
    reviews:         Option<ReviewGate>,
    /// Shared test suite.
    #[builder(default)]
    suite:           TestSuite,
    /// Runner limits.
    #[builder(default)]
    options:         RunOptions,
    /// Grade with tests only.
    #[builder(default)]
    skip_llm:        bool,
    /// Slack on top of the runner deadline before the call is abandoned.
    #[builder(default = Duration::from_secs(10))]
    execution_grace: Duration,
}

/// Outcome of the single test run of a submission.
enum TestRun {
    /// No criterion uses tests.
    NotNeeded,
    /// The runner reported outcomes.
    Finished(Vec<TestOutcome>),
    /// The runner hit its deadline; every declared test is flagged.
    TimedOut {
        /// Synthesised timeout outcomes.
        outcomes: Vec<TestOutcome>,
        /// Deadline that was exceeded.
        limit:    Duration,
    },
    /// The runner produced no results.
    Crashed(String),
}

impl TestRun {
    /// Flags every declared test as failed by timeout.
    fn timed_out(rubric: &Rubric, limit: Duration) -> Self {
        let outcomes = rubric
            .declared_tests()
            .into_iter()
            .map(|id| TestOutcome {
                test_id:       id,
                status:        TestStatus::Failed,
                diagnostic:    format!("test run exceeded {limit:?}"),
                duration_secs: limit.as_secs_f64(),
                violation:     Some(LimitViolation::Timeout),
            })
            .collect();
        TestRun::TimedOut { outcomes, limit }
    }

    /// Reported or synthesised outcomes.
    fn outcomes(&self) -> &[TestOutcome] {
        match self {
            TestRun::Finished(outcomes) | TestRun::TimedOut { outcomes, .. } => outcomes,
            TestRun::NotNeeded | TestRun::Crashed(_) => &[],
        }
    }

    /// Test-derived award for `criterion`.
    fn award(&self, criterion: &Criterion) -> TestAward {
        match self {
            TestRun::Crashed(_) => TestAward::crashed(criterion.tests.len()),
            _ => test_fraction(criterion, self.outcomes()),
        }
    }

    /// Whether every test passed; `None` if tests were not run.
    fn tests_passed(&self) -> Option<bool> {
        match self {
            TestRun::NotNeeded => None,
            TestRun::Finished(o) => Some(!o.is_empty() && o.iter().all(TestOutcome::satisfied)),
            TestRun::TimedOut { .. } | TestRun::Crashed(_) => Some(false),
        }
    }

    /// One-line description for reviewer context.
    fn summary(&self) -> String {
        match self {
            TestRun::NotNeeded => "No automated tests for this assignment.".to_string(),
            TestRun::Finished(o) => render_summary(o),
            TestRun::TimedOut { limit, .. } => format!("Test run timed out after {limit:?}."),
            TestRun::Crashed(msg) => format!("Test run crashed: {msg}"),
        }
    }
}

impl SubmissionWorkflow {
    /// Whether LLM-graded criteria are sent for review.
    pub fn reviews_enabled(&self) -> bool {
        !self.skip_llm && self.reviews.is_some()
    }

    /// Grades `submission` against `rubric`.
    pub async fn grade(&self, submission: &Submission, rubric: &Rubric) -> GradeRecord {
        let span = tracing::info_span!("grade", student = %submission.student_id);
        self.grade_inner(submission, rubric).instrument(span).await
    }

    /// Body of [`Self::grade`], run inside the submission's span.
    async fn grade_inner(&self, submission: &Submission, rubric: &Rubric) -> GradeRecord {
        let version = rubric.version();
        let max_points = rubric.total_points;

        let mut artifacts = match SubmissionArtifacts::load(submission) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                tracing::warn!(error = %e, "submission could not be loaded");
                let issue = GradeError::Validation(e.to_string()).into_issue();
                return GradeRecord::failed(&submission.student_id, version, max_points, issue);
            }
        };

        let run = if rubric.needs_tests() {
            self.run_tests(submission, rubric).await
        } else {
            TestRun::NotNeeded
        };

        let mut issues = Vec::new();
        let mut notes = Vec::new();
        let mut degraded = false;
        match &run {
            TestRun::Crashed(msg) => {
                degraded = true;
                issues.push(GradeError::ExecutionCrash(msg.clone()).into_issue());
            }
            TestRun::TimedOut { limit, .. } => {
                notes.push(GradeError::ExecutionTimeout(*limit).to_string());
            }
            TestRun::NotNeeded | TestRun::Finished(_) => {}
        }

        let reviewing = self.reviews_enabled();
        let mut reviews = if reviewing {
            self.describe_figures(submission, rubric, &mut artifacts).await;
            self.review_all(submission, rubric, &artifacts, &run).await
        } else {
            HashMap::new()
        };

        let mut scores = Vec::with_capacity(rubric.criteria.len());
        let mut not_graded = Vec::new();
        for criterion in &rubric.criteria {
            let max = criterion.max_points;
            let review = reviews.remove(&criterion.id);

            match criterion.mode {
                GradingMode::Test => {
                    let award = run.award(criterion);
                    scores.push(
                        CriterionScore::builder()
                            .criterion_id(&criterion.id)
                            .awarded(clamp_points(max * award.fraction, max))
                            .max_points(max)
                            .source(ScoreSource::Test)
                            .feedback(award.summary())
                            .build(),
                    );
                }
                GradingMode::Llm => match review {
                    None => not_graded.push(criterion.id.clone()),
                    Some(Ok((score, attempts))) => scores.push(
                        CriterionScore::builder()
                            .criterion_id(&criterion.id)
                            .awarded(clamp_points(score.awarded, max))
                            .max_points(max)
                            .source(ScoreSource::Llm)
                            .feedback(score.feedback.clone())
                            .review(review_meta(score, attempts))
                            .build(),
                    ),
                    Some(Err(failure)) => {
                        degraded = true;
                        scores.push(
                            CriterionScore::builder()
                                .criterion_id(&criterion.id)
                                .awarded(0.0)
                                .max_points(max)
                                .source(ScoreSource::Llm)
                                .feedback(format!(
                                    "Not scored: review failed after {} attempt(s) and the retry \
                                     limit was exhausted ({}).",
                                    failure.attempts, failure.last
                                ))
                                .build(),
                        );
                        issues.push(GradeError::from_review(&criterion.id, failure).into_issue());
                    }
                },
                GradingMode::Hybrid => {
                    let award = run.award(criterion);
                    let rule = criterion.hybrid;
                    let (points, review_note, meta) = match review {
                        Some(Ok((score, attempts))) => {
                            let fraction = score.awarded / max;
                            let note = score.feedback.clone();
                            (
                                rule.combine(max, award.fraction, Some(fraction)),
                                note,
                                Some(review_meta(score, attempts)),
                            )
                        }
                        Some(Err(failure)) => {
                            degraded = true;
                            let note = format!(
                                "review failed after {} attempt(s) and the retry limit was \
                                 exhausted; awarded the test-gated floor",
                                failure.attempts
                            );
                            issues
                                .push(GradeError::from_review(&criterion.id, failure).into_issue());
                            (rule.floor(max, award.fraction), note, None)
                        }
                        None => (
                            rule.floor(max, award.fraction),
                            "LLM review skipped; awarded the test-gated floor".to_string(),
                            None,
                        ),
                    };
                    scores.push(
                        CriterionScore::builder()
                            .criterion_id(&criterion.id)
                            .awarded(clamp_points(points, max))
                            .max_points(max)
                            .source(ScoreSource::Hybrid)
                            .feedback(format!("Tests: {}. Review: {review_note}", award.summary()))
                            .maybe_review(meta)
                            .build(),
                    );
                }
            }
        }

        let llm_skipped = !reviewing && rubric.criteria.iter().any(|c| c.mode.uses_review());
        if !not_graded.is_empty() {
            notes.push(format!("LLM grading skipped; not graded: {}", not_graded.join(", ")));
        }

        let raw_total: f64 = scores.iter().map(|s| s.awarded).sum();
        let total_points = clamp_points(raw_total, max_points);
        let status = if degraded {
            GradeStatus::Partial
        } else {
            GradeStatus::Complete
        };

        let mut feedback: Vec<String> = scores
            .iter()
            .map(|s| {
                let section = rubric
                    .criterion(&s.criterion_id)
                    .map_or(s.criterion_id.as_str(), Criterion::section_name);
                format!("{section} ({:.1}/{:.1}): {}", s.awarded, s.max_points, s.feedback)
            })
            .collect();
        feedback.extend(notes);

        tracing::info!(total = total_points, max = max_points, %status, "graded");
        GradeRecord {
            submission_id: submission.student_id.clone(),
            rubric_version: version,
            scores,
            total_points,
            max_points,
            feedback: feedback.join("\n"),
            status,
            errors: issues,
            tests_passed: run.tests_passed(),
            llm_skipped,
            graded_at: Utc::now(),
        }
    }

    /// Runs the tests exactly once under a hard timeout.
    async fn run_tests(&self, submission: &Submission, rubric: &Rubric) -> TestRun {
        let suite = match (&self.suite.tests_dir, &rubric.test_suite) {
            (None, Some(dir)) => TestSuite {
                tests_dir: Some(dir.clone()),
                data_dir:  self.suite.data_dir.clone(),
            },
            _ => self.suite.clone(),
        };
        let hard_limit = self.options.timeout + self.execution_grace;
        let call = self.executor.run_tests(submission, &suite, &self.options);

        match tokio::time::timeout(hard_limit, call).await {
            Ok(Ok(outcomes)) => {
                tracing::debug!(summary = %render_summary(&outcomes), "tests finished");
                TestRun::Finished(outcomes)
            }
            Ok(Err(ExecutionError::Timeout(limit))) => {
                tracing::warn!(?limit, "test run timed out");
                TestRun::timed_out(rubric, limit)
            }
            Ok(Err(ExecutionError::Crash(msg))) => {
                tracing::warn!(error = %msg, "test runner crashed");
                TestRun::Crashed(msg)
            }
            Err(_) => {
                tracing::warn!(limit = ?hard_limit, "test run abandoned at hard timeout");
                TestRun::timed_out(rubric, hard_limit)
            }
        }
    }

    /// Describes the report's figures when a reviewed criterion reads the
    /// report. A figure that cannot be described is listed without one.
    async fn describe_figures(
        &self,
        submission: &Submission,
        rubric: &Rubric,
        artifacts: &mut SubmissionArtifacts,
    ) {
        let Some(gate) = &self.reviews else {
            return;
        };
        let reads_report = rubric
            .criteria
            .iter()
            .any(|c| c.mode.uses_review() && c.artifact != Artifact::Code);
        if !reads_report {
            return;
        }

        let pending = artifacts
            .figures
            .iter()
            .enumerate()
            .filter_map(|(index, figure)| {
                let request = FigureRequest::builder()
                    .submission_id(&submission.student_id)
                    .caption(&figure.caption)
                    .path(figure.file.clone()?)
                    .build();
                Some(async move { (index, gate.describe_figure(&request).await) })
            });

        for (index, result) in join_all(pending).await {
            let figure = &mut artifacts.figures[index];
            match result {
                Ok((description, _)) => figure.description = Some(description),
                Err(failure) => {
                    tracing::warn!(figure = %figure.path, error = %failure, "figure not described");
                }
            }
        }
    }

    /// Reviews every LLM-graded criterion concurrently and waits for all of
    /// them.
    async fn review_all(
        &self,
        submission: &Submission,
        rubric: &Rubric,
        artifacts: &SubmissionArtifacts,
        run: &TestRun,
    ) -> HashMap<String, ReviewResult> {
        let Some(gate) = &self.reviews else {
            return HashMap::new();
        };
        let outline = rubric.outline();
        let run_summary = run.summary();

        let pending = rubric
            .criteria
            .iter()
            .filter(|c| c.mode.uses_review())
            .map(|criterion| {
                let mut context = format!("{outline}\n\n## Automated test results\n\n{run_summary}");
                if criterion.mode.uses_tests() {
                    context.push_str(&format!(
                        "\nTests for this criterion: {}",
                        run.award(criterion).summary()
                    ));
                }
                let request = ReviewRequest::builder()
                    .submission_id(&submission.student_id)
                    .criterion(criterion.clone())
                    .artifact_text(artifacts.text_for(criterion.artifact))
                    .context(context)
                    .build();
                async move {
                    let result = gate.review(&request).await;
                    (request.criterion.id, result)
                }
            });

        join_all(pending).await.into_iter().collect()
    }
}

/// Review provenance for a score.
fn review_meta(score: ReviewScore, attempts: u32) -> ReviewMeta {
    ReviewMeta {
        model: score.model,
        confidence: score.confidence,
        attempts,
        raw_response: score.raw_response,
    }
}
