#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Scoring submission artifacts against a criterion with an LLM.

/// OpenAI-compatible review client.
pub mod openai;
/// Retry, timeout and concurrency bounds around a review client.
pub mod retry;

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rubric::Criterion;

/// Everything the reviewer needs to score one criterion.
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct ReviewRequest {
    /// Submission being reviewed.
    pub submission_id: String,
    /// Criterion to score against.
    pub criterion:     Criterion,
    /// Artifact text (report, code or both).
    pub artifact_text: String,
    /// Assignment outline and test summary.
    #[builder(default)]
    pub context:       String,
}

/// A report figure to be described for the reviewer.
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct FigureRequest {
    /// Submission the figure belongs to.
    pub submission_id: String,
    /// Alt text from the report, possibly empty.
    #[builder(default)]
    pub caption:       String,
    /// Image file inside the submission folder.
    #[builder(into)]
    pub path:          PathBuf,
}

/// A reviewer's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewScore {
    /// Points awarded, already bounded to the criterion maximum.
    pub awarded:      f64,
    /// Feedback for the student.
    pub feedback:     String,
    /// Self-reported confidence in `[0, 1]`, if given.
    pub confidence:   Option<f64>,
    /// Model that produced the score.
    pub model:        String,
    /// Raw provider response.
    pub raw_response: String,
}

/// Why a review attempt failed.
#[derive(Debug, Clone, Error)]
pub enum ReviewError {
    /// The attempt exceeded its timeout.
    #[error("review timed out after {0:?}")]
    Timeout(Duration),
    /// The provider signalled rate limiting.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Transport or server-side failure.
    #[error("provider error: {0}")]
    Provider(String),
    /// The response did not match the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The request itself was refused (bad credentials, invalid request).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ReviewError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReviewError::Rejected(_))
    }
}

/// Scores an artifact against a criterion.
#[async_trait]
pub trait ReviewClient: Send + Sync {
    /// Produces one score. Implementations report failures; the caller owns
    /// retries and timeouts.
    async fn score(&self, request: &ReviewRequest) -> Result<ReviewScore, ReviewError>;

    /// Describes what a figure shows so that reviews of the report can take
    /// it into account. Clients without image input decline.
    async fn describe_figure(&self, request: &FigureRequest) -> Result<String, ReviewError> {
        Err(ReviewError::Rejected(format!(
            "this reviewer cannot describe images ({})",
            request.path.display()
        )))
    }
}

/// Clamps a provider score into `[0, criterion.max_points]`.
///
/// A missing, negative or non-finite award is malformed.
pub fn bound_score(mut score: ReviewScore, criterion: &Criterion) -> Result<ReviewScore, ReviewError> {
    if !score.awarded.is_finite() || score.awarded < 0.0 {
        return Err(ReviewError::Malformed(format!(
            "awarded {} is outside 0..={}",
            score.awarded, criterion.max_points
        )));
    }
    if score.awarded > criterion.max_points {
        tracing::debug!(
            criterion = %criterion.id,
            awarded = score.awarded,
            max = criterion.max_points,
            "clamping review score"
        );
        score.awarded = criterion.max_points;
    }
    score.confidence = score.confidence.map(|c| c.clamp(0.0, 1.0));
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(awarded: f64) -> ReviewScore {
        ReviewScore {
            awarded,
            feedback: "ok".into(),
            confidence: Some(1.4),
            model: "test".into(),
            raw_response: String::new(),
        }
    }

    #[test]
    fn bound_score_clamps_and_rejects() {
        let criterion = Criterion::builder().id("c").max_points(10.0).build();

        let clamped = bound_score(score(12.0), &criterion).expect("clamped");
        assert_eq!(clamped.awarded, 10.0);
        assert_eq!(clamped.confidence, Some(1.0));

        assert!(matches!(
            bound_score(score(-1.0), &criterion),
            Err(ReviewError::Malformed(_))
        ));
        assert!(matches!(
            bound_score(score(f64::NAN), &criterion),
            Err(ReviewError::Malformed(_))
        ));
    }

    #[test]
    fn only_rejections_are_final() {
        assert!(ReviewError::Malformed("x".into()).is_retryable());
        assert!(ReviewError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ReviewError::Rejected("bad key".into()).is_retryable());
    }
}
