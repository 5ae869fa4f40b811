#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::fmt::Display;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use super::error::ErrorKind;

/// Pipeline status of a grade record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeStatus {
    /// Not graded in this run (dispatch was cancelled).
    #[default]
    Pending,
    /// Graded, but at least one criterion could not be scored cleanly.
    Partial,
    /// Every criterion was scored.
    Complete,
    /// The submission could not be graded at all.
    Failed,
}

impl GradeStatus {
    /// Whether the record is final and may be persisted.
    pub fn is_terminal(self) -> bool {
        !matches!(self, GradeStatus::Pending)
    }
}

impl Display for GradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GradeStatus::Pending => "pending",
            GradeStatus::Partial => "partial",
            GradeStatus::Complete => "complete",
            GradeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which channel produced a criterion score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// Derived from test outcomes.
    Test,
    /// Derived from the LLM reviewer.
    Llm,
    /// Combination of both.
    Hybrid,
}

impl Display for ScoreSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScoreSource::Test => "test",
            ScoreSource::Llm => "llm",
            ScoreSource::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// Provenance of an LLM-derived score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewMeta {
    /// Model that produced the score.
    pub model:        String,
    /// Self-reported confidence.
    pub confidence:   Option<f64>,
    /// Calls made before the score was accepted.
    pub attempts:     u32,
    /// Raw provider response.
    pub raw_response: String,
}

#[derive(Debug, Tabled, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(on(String, into))]
/// Points awarded for one criterion
pub struct CriterionScore {
    #[tabled(rename = "Criterion")]
    /// * `criterion_id`: the criterion this score belongs to
    pub criterion_id: String,
    #[tabled(rename = "Awarded")]
    /// * `awarded`: points awarded, `0 <= awarded <= max_points`
    pub awarded:      f64,
    #[tabled(rename = "Out Of")]
    /// * `max_points`: the criterion maximum
    pub max_points:   f64,
    #[tabled(rename = "Source")]
    /// * `source`: which channel produced the score
    pub source:       ScoreSource,
    #[tabled(rename = "Feedback")]
    /// * `feedback`: explanation for the student
    #[builder(default)]
    pub feedback:     String,
    #[tabled(skip)]
    /// * `review`: reviewer metadata for LLM-derived scores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review:       Option<ReviewMeta>,
}

/// A problem encountered while grading one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeIssue {
    /// Error category.
    pub kind:      ErrorKind,
    /// Affected criterion, if the issue is criterion-specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criterion: Option<String>,
    /// Human-readable description.
    pub message:   String,
}

/// Terminal outcome of grading one submission; the unit of persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    /// Student identifier.
    pub submission_id:  String,
    /// Version of the rubric the record was graded against.
    pub rubric_version: String,
    /// Scores in rubric order.
    pub scores:         Vec<CriterionScore>,
    /// Sum of awarded points, clamped to `max_points`.
    pub total_points:   f64,
    /// Declared rubric maximum.
    pub max_points:     f64,
    /// Overall feedback.
    pub feedback:       String,
    /// Pipeline status.
    pub status:         GradeStatus,
    /// Problems encountered while grading.
    #[serde(default)]
    pub errors:         Vec<GradeIssue>,
    /// Whether every test passed; `None` when no tests were run.
    #[serde(default)]
    pub tests_passed:   Option<bool>,
    /// Whether LLM-graded criteria were left out because reviews were off.
    #[serde(default)]
    pub llm_skipped:    bool,
    /// When grading finished.
    pub graded_at:      DateTime<Utc>,
}

impl GradeRecord {
    /// A record for a submission that could not be graded.
    pub fn failed(
        submission_id: impl Into<String>,
        rubric_version: impl Into<String>,
        max_points: f64,
        issue: GradeIssue,
    ) -> Self {
        Self {
            submission_id: submission_id.into(),
            rubric_version: rubric_version.into(),
            scores: Vec::new(),
            total_points: 0.0,
            max_points,
            feedback: format!("Grading failed: {}", issue.message),
            status: GradeStatus::Failed,
            errors: vec![issue],
            tests_passed: None,
            llm_skipped: false,
            graded_at: Utc::now(),
        }
    }

    /// A placeholder for a submission that was never dispatched.
    pub fn pending(
        submission_id: impl Into<String>,
        rubric_version: impl Into<String>,
        max_points: f64,
    ) -> Self {
        Self {
            submission_id: submission_id.into(),
            rubric_version: rubric_version.into(),
            scores: Vec::new(),
            total_points: 0.0,
            max_points,
            feedback: "Not graded: the run was cancelled before this submission was dispatched."
                .to_string(),
            status: GradeStatus::Pending,
            errors: Vec::new(),
            tests_passed: None,
            llm_skipped: false,
            graded_at: Utc::now(),
        }
    }

    /// Score for `criterion_id`, if present.
    pub fn score(&self, criterion_id: &str) -> Option<&CriterionScore> {
        self.scores.iter().find(|s| s.criterion_id == criterion_id)
    }

    /// Total as a percentage of the maximum.
    pub fn percent(&self) -> f64 {
        if self.max_points > 0.0 {
            self.total_points / self.max_points * 100.0
        } else {
            0.0
        }
    }
}
