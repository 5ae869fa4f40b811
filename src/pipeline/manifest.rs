#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::collections::{BTreeMap, BTreeSet};

use crate::grade::{GradeRecord, GradeStatus};

/// Terminal status of every graded submission for one rubric version.
///
/// Rebuilt from persisted records at startup; only the orchestrator updates
/// it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunManifest {
    /// Rubric version the statuses belong to.
    pub rubric_version: String,
    /// Terminal status per submission id.
    pub statuses:       BTreeMap<String, GradeStatus>,
    /// Submissions whose record was graded without LLM review.
    pub llm_skipped:    BTreeSet<String>,
}

impl RunManifest {
    /// Empty manifest for `rubric_version`.
    pub fn new(rubric_version: impl Into<String>) -> Self {
        Self {
            rubric_version: rubric_version.into(),
            statuses:       BTreeMap::new(),
            llm_skipped:    BTreeSet::new(),
        }
    }

    /// Builds a manifest from records, ignoring records of other rubric
    /// versions and non-terminal records.
    pub fn from_records<'a>(
        rubric_version: &str,
        records: impl IntoIterator<Item = &'a GradeRecord>,
    ) -> Self {
        let mut manifest = Self::new(rubric_version);
        for record in records {
            manifest.record(record);
        }
        manifest
    }

    /// Notes a record's status if it is terminal and of this version.
    pub fn record(&mut self, record: &GradeRecord) {
        if record.rubric_version == self.rubric_version && record.status.is_terminal() {
            self.statuses
                .insert(record.submission_id.clone(), record.status);
            if record.llm_skipped {
                self.llm_skipped.insert(record.submission_id.clone());
            } else {
                self.llm_skipped.remove(&record.submission_id);
            }
        }
    }

    /// Whether `submission_id` already has a complete record.
    pub fn is_complete(&self, submission_id: &str) -> bool {
        self.statuses.get(submission_id) == Some(&GradeStatus::Complete)
    }

    /// Whether the complete record of `submission_id` can stand in for a
    /// run that does or does not review.
    ///
    /// A record graded without reviews is missing its LLM scores, so it is
    /// only reused by another run without reviews.
    pub fn is_reusable(&self, submission_id: &str, reviewing: bool) -> bool {
        self.is_complete(submission_id)
            && !(reviewing && self.llm_skipped.contains(submission_id))
    }

    /// Number of complete submissions.
    pub fn complete_count(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| **s == GradeStatus::Complete)
            .count()
    }
}
