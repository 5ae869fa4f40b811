#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Student submissions: discovery on disk and artifact loading.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::{Context, Result};
use bon::Builder;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    constants::{
        ANSWERS_FILENAME, IGNORED_DIRS, IMAGE_EXTENSIONS, PROMPT_TRUNCATE, REPORT_FILENAME,
        REPORT_TRUNCATE, TEACHER_ANSWERS_FILENAME,
    },
    rubric::Artifact,
    util::truncate,
};

/// One student's submission folder. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(on(String, into))]
pub struct Submission {
    /// Student identifier (the folder name).
    pub student_id:    String,
    /// Submission folder.
    #[builder(into)]
    pub root:          PathBuf,
    /// Code artifact, if one was found.
    pub code_path:     Option<PathBuf>,
    /// Written report, if one was found.
    pub report_path:   Option<PathBuf>,
    /// When the submission was ingested.
    #[builder(default = Utc::now())]
    pub discovered_at: DateTime<Utc>,
}

/// File names that identify a submission's artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactNames {
    /// Candidate code files, first match wins.
    pub code:   Vec<String>,
    /// Report file name.
    pub report: String,
}

impl Default for ArtifactNames {
    fn default() -> Self {
        Self {
            code:   vec![ANSWERS_FILENAME.to_string(), TEACHER_ANSWERS_FILENAME.to_string()],
            report: REPORT_FILENAME.to_string(),
        }
    }
}

/// Lists every submission folder under `dir`, sorted by name.
///
/// Hidden directories and the shared `tests`/`__pycache__` folders are
/// skipped. A folder without a code artifact is still returned so that it is
/// graded (and reported) as failed rather than silently dropped.
pub fn discover_submissions(dir: &Path, names: &ArtifactNames) -> Result<Vec<Submission>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Could not read submissions directory {}", dir.display()))?;

    let mut submissions = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Could not list {}", dir.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || IGNORED_DIRS.contains(&name.as_str()) {
            continue;
        }

        let code_path = names.code.iter().map(|f| path.join(f)).find(|p| p.is_file());
        let report_path = Some(path.join(&names.report)).filter(|p| p.is_file());
        if code_path.is_none() {
            tracing::warn!(student = %name, "no code artifact found");
        }

        submissions.push(
            Submission::builder()
                .student_id(name)
                .root(path)
                .maybe_code_path(code_path)
                .maybe_report_path(report_path)
                .build(),
        );
    }

    submissions.sort_by(|a, b| a.student_id.cmp(&b.student_id));
    Ok(submissions)
}

/// Why a submission's artifacts could not be loaded.
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// The submission folder does not exist.
    #[error("submission folder {0} does not exist")]
    MissingRoot(PathBuf),
    /// No code artifact was found.
    #[error("no code artifact found for `{0}`")]
    MissingCode(String),
    /// An artifact exists but could not be read.
    #[error("could not read {path}: {source}")]
    Unreadable {
        /// Artifact path.
        path:   PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Markdown image link: `![caption](target)`.
static FIGURE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[(.*?)\]\((.*?)\)").expect("figure link pattern is valid"));

/// A figure referenced from the report.
#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    /// Alt text.
    pub caption:     String,
    /// Link target as written in the report.
    pub path:        String,
    /// The image inside the submission folder, if it could be found.
    pub file:        Option<PathBuf>,
    /// What the figure shows, once a reviewer has described it.
    pub description: Option<String>,
}

/// Loaded artifact contents for one submission.
#[derive(Debug, Clone)]
pub struct SubmissionArtifacts {
    /// Source code.
    pub code:    String,
    /// Report text, if submitted.
    pub report:  Option<String>,
    /// Images referenced from the report.
    pub figures: Vec<Figure>,
}

impl SubmissionArtifacts {
    /// Reads the artifacts of `submission` from disk.
    pub fn load(submission: &Submission) -> Result<Self, SubmissionError> {
        if !submission.root.is_dir() {
            return Err(SubmissionError::MissingRoot(submission.root.clone()));
        }
        let code_path = submission
            .code_path
            .as_ref()
            .ok_or_else(|| SubmissionError::MissingCode(submission.student_id.clone()))?;
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|source| SubmissionError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        };

        let code = read(code_path)?;
        let report = match &submission.report_path {
            Some(path) => Some(read(path)?),
            None => None,
        };
        let figures = report
            .as_deref()
            .map(|r| extract_figures(r, &submission.root))
            .unwrap_or_default();

        Ok(Self {
            code,
            report,
            figures,
        })
    }

    /// Text handed to the reviewer for a criterion reading `artifact`.
    pub fn text_for(&self, artifact: Artifact) -> String {
        match artifact {
            Artifact::Code => self.code_text(),
            Artifact::Report => self.report_text(),
            Artifact::Both => format!(
                "## Report\n\n{}\n\n## Code\n\n{}",
                self.report_text(),
                self.code_text()
            ),
        }
    }

    /// Code fenced for the prompt.
    fn code_text(&self) -> String {
        format!("```python\n{}\n```", truncate(&self.code, PROMPT_TRUNCATE))
    }

    /// Report text followed by a list of its figures and their descriptions.
    fn report_text(&self) -> String {
        let Some(report) = self.report.as_deref().filter(|r| !r.trim().is_empty()) else {
            return "(no report submitted)".to_string();
        };

        let mut text = truncate(report, REPORT_TRUNCATE);
        if !self.figures.is_empty() {
            text.push_str("\n\nFigures referenced in the report:\n");
            for fig in &self.figures {
                let missing = if fig.file.is_some() { "" } else { " (file missing)" };
                text.push_str(&format!("- {}: {}{missing}\n", fig.path, fig.caption));
                if let Some(description) = &fig.description {
                    text.push_str(&format!("  Description: {}\n", description.trim()));
                }
            }
        }
        text
    }
}

/// Finds `![caption](path)` image links whose target has an image extension.
///
/// A target is looked up relative to `root`, then by file name alone.
pub fn extract_figures(report: &str, root: &Path) -> Vec<Figure> {
    FIGURE_LINK
        .captures_iter(report)
        .filter_map(|cap| {
            let caption = cap[1].trim();
            let path = cap[2].trim();
            let is_image = Path::new(path)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            is_image.then(|| Figure {
                caption:     caption.to_string(),
                path:        path.to_string(),
                file:        locate_figure(root, path),
                description: None,
            })
        })
        .collect()
}

/// The image file a report link points at, if it exists.
fn locate_figure(root: &Path, target: &str) -> Option<PathBuf> {
    let direct = root.join(target);
    if direct.is_file() {
        return Some(direct);
    }
    Path::new(target)
        .file_name()
        .map(|name| root.join(name))
        .filter(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn figures_are_filtered_by_extension() {
        let report = "Intro ![Age histogram](plots/age.PNG) and ![link](notes.txt) \
                      and ![scatter](scatter.png)";
        let figures = extract_figures(report, Path::new("/nonexistent"));

        assert_eq!(figures.len(), 2);
        assert_eq!(figures[0].caption, "Age histogram");
        assert_eq!(figures[0].path, "plots/age.PNG");
        assert!(figures[0].file.is_none());
        assert_eq!(figures[1].path, "scatter.png");
    }

    #[test]
    fn figures_are_found_by_file_name_when_the_link_path_is_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("hist.png"), b"png").expect("write");
        let report = "![](/home/student/lab/hist.png)\n![Ages]( hist.png )\n![gone](gone.jpg)";

        let figures = extract_figures(report, dir.path());

        assert_eq!(figures.len(), 3);
        assert_eq!(figures[0].file.as_deref(), Some(dir.path().join("hist.png").as_path()));
        assert_eq!(figures[1].caption, "Ages");
        assert_eq!(figures[1].path, "hist.png");
        assert!(figures[1].file.is_some());
        assert!(figures[2].file.is_none());
    }

    #[test]
    fn discovery_skips_hidden_and_shared_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["bob", "alice", ".git", "tests", "__pycache__"] {
            std::fs::create_dir(dir.path().join(name)).expect("mkdir");
        }
        std::fs::write(dir.path().join("alice").join(ANSWERS_FILENAME), "x = 1").expect("write");
        std::fs::write(dir.path().join("alice").join(REPORT_FILENAME), "# Report").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "not a submission").expect("write");

        let found = discover_submissions(dir.path(), &ArtifactNames::default()).expect("discover");
        let ids: Vec<&str> = found.iter().map(|s| s.student_id.as_str()).collect();

        assert_eq!(ids, vec!["alice", "bob"]);
        assert!(found[0].code_path.is_some());
        assert!(found[0].report_path.is_some());
        assert!(found[1].code_path.is_none());
    }

    #[test]
    fn missing_code_fails_to_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let submission = Submission::builder()
            .student_id("carol")
            .root(dir.path())
            .build();

        let err = SubmissionArtifacts::load(&submission).expect_err("no code");
        assert!(matches!(err, SubmissionError::MissingCode(_)));
    }

    #[test]
    fn report_text_lists_figures() {
        let artifacts = SubmissionArtifacts {
            code:    "def f(): pass".into(),
            report:  Some("Findings ![trend](trend.png)".into()),
            figures: vec![Figure {
                caption:     "trend".into(),
                path:        "trend.png".into(),
                file:        Some(PathBuf::from("trend.png")),
                description: Some("A line chart of monthly sales rising from 10 to 40.".into()),
            }],
        };

        let text = artifacts.text_for(Artifact::Both);
        assert!(text.contains("- trend.png: trend\n"));
        assert!(text.contains("  Description: A line chart of monthly sales"));
        assert!(text.contains("```python"));
    }
}
