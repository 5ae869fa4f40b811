#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::results::GradeIssue;
use crate::review::{ReviewError, retry::ReviewFailure};

/// Category of a grading problem, as persisted in a record's error list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The submission (or rubric) is malformed.
    Validation,
    /// The test run exceeded its deadline.
    ExecutionTimeout,
    /// The test runner produced no results.
    ExecutionCrash,
    /// A review failed on every attempt.
    ReviewTransient,
    /// A review returned a non-conforming response on every attempt.
    ReviewMalformed,
    /// An unexpected fault (panic) while grading.
    Internal,
}

/// Failures that can occur while grading one submission.
///
/// None of these abort a run; the workflow turns each into a [`GradeIssue`].
/// Run-level persistence failures are
/// [`PipelineError::Persistence`](crate::pipeline::PipelineError::Persistence).
#[derive(Debug, Error)]
pub enum GradeError {
    /// Missing or unreadable submission artifacts.
    #[error("validation error: {0}")]
    Validation(String),
    /// The test run timed out; affected tests count as failed.
    #[error("test run exceeded its {0:?} deadline; unfinished tests count as failed")]
    ExecutionTimeout(Duration),
    /// The test runner crashed without reporting any result.
    #[error("test runner crashed: {0}")]
    ExecutionCrash(String),
    /// A review kept failing with retryable errors.
    #[error("review of `{criterion}` failed: {failure}")]
    ReviewTransient {
        /// Criterion being reviewed.
        criterion: String,
        /// Final failure.
        failure:   ReviewFailure,
    },
    /// A review kept returning malformed responses.
    #[error("review of `{criterion}` returned malformed output: {failure}")]
    ReviewMalformed {
        /// Criterion being reviewed.
        criterion: String,
        /// Final failure.
        failure:   ReviewFailure,
    },
    /// A panic or other unexpected fault.
    #[error("internal fault: {0}")]
    Fault(String),
}

impl GradeError {
    /// Wraps a review failure, distinguishing malformed responses.
    pub fn from_review(criterion: impl Into<String>, failure: ReviewFailure) -> Self {
        let criterion = criterion.into();
        match failure.last {
            ReviewError::Malformed(_) => GradeError::ReviewMalformed { criterion, failure },
            _ => GradeError::ReviewTransient { criterion, failure },
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GradeError::Validation(_) => ErrorKind::Validation,
            GradeError::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
            GradeError::ExecutionCrash(_) => ErrorKind::ExecutionCrash,
            GradeError::ReviewTransient { .. } => ErrorKind::ReviewTransient,
            GradeError::ReviewMalformed { .. } => ErrorKind::ReviewMalformed,
            GradeError::Fault(_) => ErrorKind::Internal,
        }
    }

    /// Criterion named by this error, if any.
    pub fn criterion(&self) -> Option<&str> {
        match self {
            GradeError::ReviewTransient { criterion, .. }
            | GradeError::ReviewMalformed { criterion, .. } => Some(criterion),
            _ => None,
        }
    }

    /// Converts the error into record data.
    pub fn into_issue(self) -> GradeIssue {
        GradeIssue {
            kind:      self.kind(),
            criterion: self.criterion().map(str::to_string),
            message:   self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_review_failures_keep_their_kind() {
        let failure = ReviewFailure {
            attempts: 3,
            last:     ReviewError::Malformed("not json".into()),
        };
        let issue = GradeError::from_review("analysis", failure).into_issue();

        assert_eq!(issue.kind, ErrorKind::ReviewMalformed);
        assert_eq!(issue.criterion.as_deref(), Some("analysis"));
        assert!(issue.message.contains("after 3 attempt(s)"));
    }
}
