#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Class-level statistics over grade records.
//!
//! [`aggregate`] is a pure function of its input and can be re-run at any
//! time against a partial or complete record set.

/// The persisted result set and its tabular renderings.
pub mod report;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::grade::{GradeRecord, GradeStatus};

/// Summary statistics of a set of scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreStats {
    /// Number of values.
    pub count:  usize,
    /// Arithmetic mean.
    pub mean:   f64,
    /// Median.
    pub median: f64,
    /// Minimum.
    pub min:    f64,
    /// Maximum.
    pub max:    f64,
}

impl ScoreStats {
    /// Statistics of `values`; all zero when empty.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let sorted: Vec<f64> = values.iter().copied().sorted_by(f64::total_cmp).collect();
        let count = sorted.len();
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        } else {
            sorted[count / 2]
        };

        Self {
            count,
            mean: sorted.iter().sum::<f64>() / count as f64,
            median,
            min: sorted[0],
            max: sorted[count - 1],
        }
    }
}

/// Count of records per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Not yet graded.
    pub pending:  usize,
    /// Graded with problems.
    pub partial:  usize,
    /// Fully graded.
    pub complete: usize,
    /// Could not be graded.
    pub failed:   usize,
}

/// Distribution of scores for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionDistribution {
    /// Criterion id.
    pub criterion_id: String,
    /// Criterion maximum.
    pub max_points:   f64,
    /// Statistics of awarded points.
    pub stats:        ScoreStats,
    /// Scores at the maximum.
    pub full_marks:   usize,
    /// Scores of zero.
    pub zero:         usize,
}

/// Class-level view of a record set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassSummary {
    /// Records considered.
    pub records:              usize,
    /// Records per status.
    pub status_counts:        StatusCounts,
    /// Total-score statistics over graded (non-pending) records.
    pub totals:               ScoreStats,
    /// Rubric maximum.
    pub max_points:           f64,
    /// Graded records whose tests all passed.
    pub tests_passed:         usize,
    /// `tests_passed` as a percentage of graded records.
    pub tests_passed_percent: f64,
    /// Per-criterion distributions, in first-seen order.
    pub criteria:             Vec<CriterionDistribution>,
}

/// Folds grade records into class statistics.
pub fn aggregate(records: &[GradeRecord]) -> ClassSummary {
    let mut status_counts = StatusCounts::default();
    for record in records {
        match record.status {
            GradeStatus::Pending => status_counts.pending += 1,
            GradeStatus::Partial => status_counts.partial += 1,
            GradeStatus::Complete => status_counts.complete += 1,
            GradeStatus::Failed => status_counts.failed += 1,
        }
    }

    let graded: Vec<&GradeRecord> = records.iter().filter(|r| r.status.is_terminal()).collect();
    let totals: Vec<f64> = graded.iter().map(|r| r.total_points).collect();
    let tests_passed = graded
        .iter()
        .filter(|r| r.tests_passed == Some(true))
        .count();
    let tests_passed_percent = if graded.is_empty() {
        0.0
    } else {
        tests_passed as f64 / graded.len() as f64 * 100.0
    };

    let scores = graded.iter().flat_map(|r| r.scores.iter());
    let by_criterion = scores.clone().into_group_map_by(|s| s.criterion_id.as_str());
    let criteria = scores
        .map(|s| s.criterion_id.as_str())
        .unique()
        .filter_map(|id| {
            let group = by_criterion.get(id)?;
            let awarded: Vec<f64> = group.iter().map(|s| s.awarded).collect();
            let max_points = group.iter().map(|s| s.max_points).fold(0.0, f64::max);
            Some(CriterionDistribution {
                criterion_id: id.to_string(),
                max_points,
                stats: ScoreStats::from_values(&awarded),
                full_marks: group
                    .iter()
                    .filter(|s| s.awarded >= s.max_points - 1e-9)
                    .count(),
                zero: group.iter().filter(|s| s.awarded <= 1e-9).count(),
            })
        })
        .collect();

    ClassSummary {
        records: records.len(),
        status_counts,
        totals: ScoreStats::from_values(&totals),
        max_points: records.iter().map(|r| r.max_points).fold(0.0, f64::max),
        tests_passed,
        tests_passed_percent,
        criteria,
    }
}
