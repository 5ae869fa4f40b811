#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Typed grading criteria consumed by the pipeline.
//!
//! A [`Rubric`] is validated input: it is loaded from a structured TOML/JSON
//! file, or from an assignment README through [`parser::parse_markdown`], and
//! checked with [`Rubric::validate`] before any submission is dispatched.

/// Markdown heading parser that derives a rubric from an assignment README.
pub mod parser;

use std::{collections::HashSet, path::{Path, PathBuf}};

use bon::Builder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::grade::scoring::HybridRule;

/// Tolerance used when comparing point sums.
const POINTS_EPSILON: f64 = 1e-6;

/// How a criterion is graded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingMode {
    /// Scored purely from unit-test outcomes.
    Test,
    /// Scored by the LLM reviewer.
    #[default]
    Llm,
    /// Test outcomes gate an LLM-derived fraction.
    Hybrid,
}

impl GradingMode {
    /// Whether this mode needs the execution client.
    pub fn uses_tests(self) -> bool {
        matches!(self, GradingMode::Test | GradingMode::Hybrid)
    }

    /// Whether this mode needs the review client.
    pub fn uses_review(self) -> bool {
        matches!(self, GradingMode::Llm | GradingMode::Hybrid)
    }
}

/// Which part of a submission the reviewer reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Artifact {
    /// The written report.
    #[default]
    Report,
    /// The submitted source code.
    Code,
    /// Report followed by code.
    Both,
}

/// How test outcomes turn into points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPolicy {
    /// Full points only if every associated test passed.
    AllOrNothing,
    /// Points proportional to the weight of passing tests.
    #[default]
    Weighted,
}

/// A test associated with a criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TestRefRepr")]
pub struct TestRef {
    /// Test identifier as reported by the runner (node id or bare name).
    pub id:     String,
    /// Relative weight under [`TestPolicy::Weighted`].
    pub weight: f64,
}

/// Accepts either a bare test name or a `{ id, weight }` table.
#[derive(Deserialize)]
#[serde(untagged)]
enum TestRefRepr {
    /// `"test_add"`
    Bare(String),
    /// `{ id = "test_add", weight = 2.0 }`
    Weighted {
        /// Test identifier.
        id:     String,
        /// Relative weight.
        #[serde(default = "default_weight")]
        weight: f64,
    },
}

/// Default test weight.
fn default_weight() -> f64 {
    1.0
}

impl From<TestRefRepr> for TestRef {
    fn from(repr: TestRefRepr) -> Self {
        match repr {
            TestRefRepr::Bare(id) => TestRef { id, weight: 1.0 },
            TestRefRepr::Weighted { id, weight } => TestRef { id, weight },
        }
    }
}

impl From<&str> for TestRef {
    fn from(id: &str) -> Self {
        TestRef {
            id:     id.to_string(),
            weight: 1.0,
        }
    }
}

/// A single scored dimension of a rubric.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(on(String, into))]
pub struct Criterion {
    /// Unique identifier within the rubric.
    pub id:           String,
    /// What the grader is looking for.
    #[serde(default)]
    #[builder(default)]
    pub description:  String,
    /// Maximum points for this criterion.
    pub max_points:   f64,
    /// Grading channel(s) used.
    #[serde(default)]
    #[builder(default)]
    pub mode:         GradingMode,
    /// Parent section; defaults to the criterion's own id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section:      Option<String>,
    /// Tests associated with this criterion.
    #[serde(default)]
    #[builder(default)]
    pub tests:        Vec<TestRef>,
    /// How test outcomes are converted to points.
    #[serde(default)]
    #[builder(default)]
    pub test_policy:  TestPolicy,
    /// Artifact read by the reviewer.
    #[serde(default)]
    #[builder(default)]
    pub artifact:     Artifact,
    /// Combination rule for hybrid criteria.
    #[serde(default)]
    #[builder(default)]
    pub hybrid:       HybridRule,
    /// Extra-credit criteria do not count towards the declared total.
    #[serde(default)]
    #[builder(default)]
    pub extra_credit: bool,
}

impl Criterion {
    /// Name of the section this criterion belongs to.
    pub fn section_name(&self) -> &str {
        self.section.as_deref().unwrap_or(&self.id)
    }
}

/// A validated, ordered set of criteria for one assignment.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(on(String, into))]
pub struct Rubric {
    /// Assignment title.
    pub title:        String,
    /// Declared maximum; non-extra criteria must sum to this.
    pub total_points: f64,
    /// Criteria in grading order.
    pub criteria:     Vec<Criterion>,
    /// Shared test suite directory, if the rubric names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_suite:   Option<PathBuf>,
    /// Raw assignment text given to the reviewer as context.
    #[serde(default)]
    #[builder(default)]
    pub description:  String,
}

/// Reasons a rubric is rejected before grading starts.
#[derive(Debug, Error)]
pub enum RubricError {
    /// The rubric file could not be read.
    #[error("could not read rubric {path}: {source}")]
    Read {
        /// Path that was read.
        path:   PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The rubric file is not valid TOML/JSON/markdown.
    #[error("could not parse rubric {path}: {message}")]
    Parse {
        /// Path that was parsed.
        path:    PathBuf,
        /// Parser diagnostic.
        message: String,
    },
    /// The rubric has no criteria.
    #[error("rubric `{0}` has no criteria")]
    Empty(String),
    /// Two criteria share an id.
    #[error("duplicate criterion id `{0}`")]
    DuplicateCriterion(String),
    /// A criterion's maximum is not a positive finite number.
    #[error("criterion `{criterion}` has invalid max points {points}")]
    InvalidPoints {
        /// Offending criterion.
        criterion: String,
        /// Value that was rejected.
        points:    f64,
    },
    /// Non-extra criteria do not add up to the declared total.
    #[error("criteria sum to {sum} points but the rubric declares {declared}")]
    TotalMismatch {
        /// Declared rubric total.
        declared: f64,
        /// Sum of non-extra criteria.
        sum:      f64,
    },
    /// A test or hybrid criterion names no tests.
    #[error("criterion `{0}` is graded by tests but declares none")]
    MissingTests(String),
    /// Any other per-criterion problem.
    #[error("criterion `{criterion}` is invalid: {reason}")]
    InvalidCriterion {
        /// Offending criterion.
        criterion: String,
        /// What is wrong with it.
        reason:    String,
    },
}

impl Rubric {
    /// Loads a rubric from disk, dispatching on the file extension.
    ///
    /// `.toml` and `.json` files are deserialized directly; anything else is
    /// treated as an assignment README and parsed from its headings.
    pub fn load(path: &Path) -> Result<Self, RubricError> {
        let content = std::fs::read_to_string(path).map_err(|source| RubricError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |message: String| RubricError::Parse {
            path: path.to_path_buf(),
            message,
        };

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| parse_err(e.to_string())),
            Some("json") => serde_json::from_str(&content).map_err(|e| parse_err(e.to_string())),
            _ => {
                let fallback = path
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "Assignment".to_string());
                parser::parse_markdown(&content, &fallback).map_err(parse_err)
            }
        }
    }

    /// Checks the structural invariants required before grading.
    pub fn validate(&self) -> Result<(), RubricError> {
        if self.criteria.is_empty() {
            return Err(RubricError::Empty(self.title.clone()));
        }
        if !self.total_points.is_finite() || self.total_points < 0.0 {
            return Err(RubricError::InvalidPoints {
                criterion: self.title.clone(),
                points:    self.total_points,
            });
        }

        let mut seen = HashSet::new();
        for criterion in &self.criteria {
            if !seen.insert(criterion.id.as_str()) {
                return Err(RubricError::DuplicateCriterion(criterion.id.clone()));
            }
            if !criterion.max_points.is_finite() || criterion.max_points <= 0.0 {
                return Err(RubricError::InvalidPoints {
                    criterion: criterion.id.clone(),
                    points:    criterion.max_points,
                });
            }
            if criterion.mode.uses_tests() && criterion.tests.is_empty() {
                return Err(RubricError::MissingTests(criterion.id.clone()));
            }
            if let Some(bad) = criterion
                .tests
                .iter()
                .find(|t| !t.weight.is_finite() || t.weight <= 0.0)
            {
                return Err(RubricError::InvalidCriterion {
                    criterion: criterion.id.clone(),
                    reason:    format!("test `{}` has non-positive weight {}", bad.id, bad.weight),
                });
            }
            if criterion.mode == GradingMode::Hybrid {
                criterion
                    .hybrid
                    .validate()
                    .map_err(|reason| RubricError::InvalidCriterion {
                        criterion: criterion.id.clone(),
                        reason,
                    })?;
            }
        }

        let sum = self.base_points();
        if (sum - self.total_points).abs() > POINTS_EPSILON {
            return Err(RubricError::TotalMismatch {
                declared: self.total_points,
                sum,
            });
        }

        Ok(())
    }

    /// Sum of the maximum points of all non-extra criteria.
    pub fn base_points(&self) -> f64 {
        self.criteria
            .iter()
            .filter(|c| !c.extra_credit)
            .map(|c| c.max_points)
            .sum()
    }

    /// Content hash identifying this rubric across runs.
    ///
    /// Any change to criteria, points or policies yields a new version, which
    /// invalidates previously persisted records.
    pub fn version(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        hex::encode(digest)[..12].to_string()
    }

    /// Looks up a criterion by id.
    pub fn criterion(&self, id: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.id == id)
    }

    /// Whether any criterion needs the execution client.
    pub fn needs_tests(&self) -> bool {
        self.criteria.iter().any(|c| c.mode.uses_tests())
    }

    /// Every test id declared by any criterion, in first-seen order.
    pub fn declared_tests(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.criteria
            .iter()
            .flat_map(|c| c.tests.iter())
            .filter(|t| seen.insert(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Plain-text outline of the rubric, used as reviewer context.
    pub fn outline(&self) -> String {
        let mut lines = vec![
            format!("# Assignment: {}", self.title),
            format!("Total Points: {}", self.total_points),
            String::new(),
            "## Grading Sections:".to_string(),
        ];

        for c in &self.criteria {
            let extra = if c.extra_credit { " [EXTRA CREDIT]" } else { "" };
            lines.push(format!("\n### {} ({} pts){extra}", c.section_name(), c.max_points));
            if !c.description.is_empty() {
                lines.push(format!("Description: {}", c.description));
            }
            if !c.tests.is_empty() {
                let names: Vec<&str> = c.tests.iter().map(|t| t.id.as_str()).collect();
                lines.push(format!("Tests: {}", names.join(", ")));
            }
        }

        lines.join("\n")
    }
}
