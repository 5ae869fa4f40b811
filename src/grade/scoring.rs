#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use serde::{Deserialize, Serialize};

use crate::{
    execution::TestOutcome,
    rubric::{Criterion, TestPolicy, TestRef},
};

/// Tolerance used for gate comparisons.
const FRACTION_EPSILON: f64 = 1e-9;

/// Combines a test pass fraction with an optional LLM fraction into points.
pub trait HybridPolicy {
    /// Points for a criterion worth `max_points`, given the fraction of tests
    /// passed and, if a review succeeded, the reviewer's awarded fraction.
    /// `None` means no LLM signal: the result is the test-gated floor.
    fn combine(&self, max_points: f64, test_fraction: f64, llm_fraction: Option<f64>) -> f64;

    /// Points awarded without an LLM signal.
    fn floor(&self, max_points: f64, test_fraction: f64) -> f64 {
        self.combine(max_points, test_fraction, None)
    }
}

/// Built-in hybrid combination rules, selected per criterion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum HybridRule {
    /// Tests gate eligibility; the reviewer sets the fraction of the gated
    /// ceiling `max * test_fraction`.
    Gated {
        /// Minimum test fraction for any credit.
        #[serde(default = "default_threshold")]
        threshold: f64,
        /// Fraction of the ceiling awarded without an LLM signal.
        #[serde(default = "default_floor")]
        floor:     f64,
    },
    /// Linear blend: `max * (w * tests + (1 - w) * llm)`.
    Weighted {
        /// Weight of the test fraction.
        test_weight: f64,
    },
}

/// Default gate threshold: every test must pass.
fn default_threshold() -> f64 {
    1.0
}

/// Default no-LLM floor.
fn default_floor() -> f64 {
    0.7
}

impl Default for HybridRule {
    fn default() -> Self {
        HybridRule::Gated {
            threshold: default_threshold(),
            floor:     default_floor(),
        }
    }
}

impl HybridRule {
    /// Checks that every parameter lies in `[0, 1]`.
    pub fn validate(&self) -> Result<(), String> {
        let in_unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(format!("{name} must be between 0 and 1, got {v}"))
            }
        };
        match *self {
            HybridRule::Gated { threshold, floor } => {
                in_unit("threshold", threshold)?;
                in_unit("floor", floor)
            }
            HybridRule::Weighted { test_weight } => in_unit("test_weight", test_weight),
        }
    }
}

impl HybridPolicy for HybridRule {
    fn combine(&self, max_points: f64, test_fraction: f64, llm_fraction: Option<f64>) -> f64 {
        let t = test_fraction.clamp(0.0, 1.0);
        let llm = llm_fraction.map(|f| f.clamp(0.0, 1.0));
        match *self {
            HybridRule::Gated { threshold, floor } => {
                if t + FRACTION_EPSILON < threshold {
                    return 0.0;
                }
                let ceiling = max_points * t;
                ceiling * llm.unwrap_or(floor)
            }
            HybridRule::Weighted { test_weight } => {
                let w = test_weight;
                match llm {
                    Some(l) => max_points * (w * t + (1.0 - w) * l),
                    None => max_points * w * t,
                }
            }
        }
    }
}

/// Test-derived result for one criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct TestAward {
    /// Fraction of the criterion earned from tests, after the policy.
    pub fraction: f64,
    /// Associated tests that passed.
    pub passed:   usize,
    /// Associated tests.
    pub total:    usize,
    /// Per-test notes for failures and missing results.
    pub notes:    Vec<String>,
}

impl TestAward {
    /// Award used when the runner produced nothing at all.
    pub fn crashed(total: usize) -> Self {
        Self {
            fraction: 0.0,
            passed: 0,
            total,
            notes: vec!["test run crashed; no results were reported".to_string()],
        }
    }

    /// Feedback line summarising the award.
    pub fn summary(&self) -> String {
        let mut line = format!("{}/{} tests passed", self.passed, self.total);
        if !self.notes.is_empty() {
            line.push_str(&format!(" ({})", self.notes.join("; ")));
        }
        line
    }
}

/// Strips pytest parametrization, `test_x[1-2]` -> `test_x`.
fn base_name(id: &str) -> &str {
    id.split_once('[').map_or(id, |(base, _)| base)
}

/// Whether a runner outcome belongs to a declared test.
fn outcome_matches(outcome_id: &str, test: &TestRef) -> bool {
    let id = test.id.as_str();
    let base = base_name(outcome_id);
    outcome_id == id
        || base == id
        || outcome_id.ends_with(&format!("::{id}"))
        || base.ends_with(&format!("::{id}"))
}

/// Maps runner outcomes onto a criterion's tests through its policy.
///
/// A declared test with no outcome counts as failed. A parametrized test
/// passes only if every parametrization passed.
pub fn test_fraction(criterion: &Criterion, outcomes: &[TestOutcome]) -> TestAward {
    let mut passed = 0usize;
    let mut passed_weight = 0.0;
    let mut total_weight = 0.0;
    let mut notes = Vec::new();

    for test in &criterion.tests {
        total_weight += test.weight;
        let matched: Vec<&TestOutcome> = outcomes
            .iter()
            .filter(|o| outcome_matches(&o.test_id, test))
            .collect();

        if matched.is_empty() {
            notes.push(format!("{}: no result reported", test.id));
            continue;
        }
        match matched.iter().find(|o| !o.satisfied()) {
            None => {
                passed += 1;
                passed_weight += test.weight;
            }
            Some(failed) => {
                let status = format!("{:?}", failed.status).to_lowercase();
                let mut note = format!("{}: {status}", test.id);
                if let Some(v) = failed.violation {
                    note.push_str(&format!(" ({v:?} limit)").to_lowercase());
                }
                if !failed.diagnostic.is_empty() {
                    note.push_str(&format!(" - {}", failed.diagnostic));
                }
                notes.push(note);
            }
        }
    }

    let total = criterion.tests.len();
    let fraction = match criterion.test_policy {
        TestPolicy::AllOrNothing => {
            if total > 0 && passed == total {
                1.0
            } else {
                0.0
            }
        }
        TestPolicy::Weighted => {
            if total_weight > 0.0 {
                passed_weight / total_weight
            } else {
                0.0
            }
        }
    };

    TestAward {
        fraction,
        passed,
        total,
        notes,
    }
}

/// Bounds `points` to `[0, max]`, mapping NaN to zero.
pub fn clamp_points(points: f64, max: f64) -> f64 {
    if points.is_nan() {
        return 0.0;
    }
    points.clamp(0.0, max.max(0.0))
}
