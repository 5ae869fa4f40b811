#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

/// Per-submission error taxonomy.
pub mod error;
/// Grade record types.
pub mod results;
/// Turning test outcomes and review scores into points.
pub mod scoring;
/// The per-submission grading state machine.
pub mod workflow;

pub use error::{ErrorKind, GradeError};
pub use results::{CriterionScore, GradeIssue, GradeRecord, GradeStatus, ReviewMeta, ScoreSource};
pub use scoring::{HybridPolicy, HybridRule};
pub use workflow::SubmissionWorkflow;
