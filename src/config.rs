#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Run configuration: the `grader.toml` file, CLI overrides and OpenAI
//! credentials from the environment.
//!
//! Everything here is read once and handed to the pipeline at construction;
//! nothing is stored in process-wide state.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::{
    constants::DEFAULT_GRADES_DIR,
    execution::{IsolationMode, RunOptions, TestSuite},
    review::retry::RetryPolicy,
};

/// Default model used when `OPENAI_MODEL` is unset.
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI credentials and tuning parameters sourced from the environment.
#[derive(Clone)]
pub struct OpenAiEnv {
    /// Base URL for an OpenAI-compatible endpoint, if not the default.
    api_base:    Option<String>,
    /// API key used to authenticate requests.
    api_key:     String,
    /// Model identifier for chat completions.
    model:       String,
    /// Optional temperature override.
    temperature: Option<f32>,
}

impl std::fmt::Debug for OpenAiEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEnv")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

impl OpenAiEnv {
    /// Reads `OPENAI_API_KEY`, `OPENAI_ENDPOINT`, `OPENAI_MODEL` and
    /// `OPENAI_TEMPERATURE`; returns `None` when no API key is set.
    pub fn from_env() -> Option<Self> {
        let non_empty = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        let api_key = non_empty("OPENAI_API_KEY")?;
        let api_base = non_empty("OPENAI_ENDPOINT");
        let model = non_empty("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let temperature = non_empty("OPENAI_TEMPERATURE").and_then(|s| s.parse::<f32>().ok());

        Some(Self {
            api_base,
            api_key,
            model,
            temperature,
        })
    }

    /// Returns the API base URL, if overridden.
    pub fn api_base(&self) -> Option<&str> {
        self.api_base.as_deref()
    }

    /// Returns the API key.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Returns the model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the configured temperature, if any.
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }
}

/// Reads a `u64` from the environment, falling back to `default`.
fn read_env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Concurrency, retry and timeout bounds consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Submissions graded at once.
    pub max_concurrent_submissions: usize,
    /// Outstanding review calls across all submissions.
    pub max_concurrent_reviews:     usize,
    /// Retries after the first review attempt.
    pub review_retries:             u32,
    /// Timeout of a single review attempt.
    pub review_timeout_secs:        u64,
    /// Delay before the first review retry.
    pub backoff_base_ms:            u64,
    /// Runner deadline for one submission's tests.
    pub execution_timeout_secs:     u64,
    /// Extra time granted on top of the runner deadline before the call is
    /// abandoned.
    pub execution_grace_secs:       u64,
    /// Memory limit passed to the runner.
    pub memory_limit_mb:            Option<u64>,
    /// Where student code runs.
    pub isolation:                  IsolationMode,
    /// Grade with tests only.
    pub skip_llm:                   bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_submissions: 4,
            max_concurrent_reviews:     2,
            review_retries:             2,
            review_timeout_secs:        60,
            backoff_base_ms:            500,
            execution_timeout_secs:     120,
            execution_grace_secs:       10,
            memory_limit_mb:            None,
            isolation:                  IsolationMode::Local,
            skip_llm:                   false,
        }
    }
}

impl PipelineConfig {
    /// Applies `GRADERPOD_EXECUTION_TIMEOUT_SECS` and
    /// `GRADERPOD_REVIEW_TIMEOUT_SECS` when set.
    pub fn apply_env_overrides(&mut self) {
        self.execution_timeout_secs =
            read_env_u64("GRADERPOD_EXECUTION_TIMEOUT_SECS", self.execution_timeout_secs);
        self.review_timeout_secs =
            read_env_u64("GRADERPOD_REVIEW_TIMEOUT_SECS", self.review_timeout_secs);
    }

    /// Retry policy for review calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries:      self.review_retries,
            timeout:      Duration::from_secs(self.review_timeout_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }

    /// Limits passed to the execution client.
    pub fn run_options(&self) -> RunOptions {
        RunOptions::builder()
            .timeout(Duration::from_secs(self.execution_timeout_secs))
            .maybe_memory_limit_mb(self.memory_limit_mb)
            .isolation(self.isolation.clone())
            .build()
    }

    /// Slack added to the runner deadline for the outer hard timeout.
    pub fn execution_grace(&self) -> Duration {
        Duration::from_secs(self.execution_grace_secs)
    }
}

/// Contents of `grader.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Folder containing one sub-folder per student.
    pub submissions_dir: Option<PathBuf>,
    /// Base folder for assignment files (README, tests, data).
    pub source_path:     Option<PathBuf>,
    /// Assignment README used as a rubric when `rubric_path` is unset.
    pub readme_path:     Option<PathBuf>,
    /// Structured rubric (TOML or JSON).
    pub rubric_path:     Option<PathBuf>,
    /// Shared pytest files.
    pub tests_dir:       Option<PathBuf>,
    /// Data files the tests read.
    pub test_data_dir:   Option<PathBuf>,
    /// Output folder for records and summaries.
    pub grades_dir:      Option<PathBuf>,
    /// Python interpreter for the test runner.
    pub python:          Option<PathBuf>,
    /// Show the persisted results without grading.
    pub only_dashboard:  bool,
    /// Debug-level logging.
    pub verbose:         bool,
    /// Pipeline bounds.
    pub pipeline:        PipelineConfig,
}

/// Joins `path` onto `base` unless it is already absolute.
fn resolve(base: &Path, path: &mut Option<PathBuf>) {
    if let Some(p) = path.as_mut()
        && p.is_relative()
    {
        *p = base.join(&*p);
    }
}

impl GraderConfig {
    /// Loads a config file and resolves its relative paths.
    ///
    /// `source_path`, `submissions_dir` and `grades_dir` are relative to the
    /// config file; `readme_path`, `rubric_path`, `tests_dir` and
    /// `test_data_dir` are relative to `source_path` when it is given.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file {}", path.display()))?;
        let mut config: GraderConfig = toml::from_str(&content)
            .with_context(|| format!("Could not parse config file {}", path.display()))?;

        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(config_dir);
        Ok(config)
    }

    /// Resolves relative paths against `config_dir`.
    fn resolve_paths(&mut self, config_dir: &Path) {
        resolve(config_dir, &mut self.source_path);
        let source_base = self
            .source_path
            .clone()
            .unwrap_or_else(|| config_dir.to_path_buf());

        resolve(&source_base, &mut self.readme_path);
        resolve(&source_base, &mut self.tests_dir);
        resolve(&source_base, &mut self.test_data_dir);
        resolve(&source_base, &mut self.rubric_path);
        resolve(config_dir, &mut self.submissions_dir);
        resolve(config_dir, &mut self.grades_dir);
    }

    /// Rubric file to load: the structured rubric if given, else the README.
    pub fn rubric_source(&self) -> Result<&Path> {
        match (&self.rubric_path, &self.readme_path) {
            (Some(rubric), _) => Ok(rubric.as_path()),
            (None, Some(readme)) => Ok(readme.as_path()),
            (None, None) => bail!("No rubric configured: set `rubric_path` or `readme_path`"),
        }
    }

    /// Folder holding submissions.
    pub fn submissions_dir(&self) -> Result<&Path> {
        self.submissions_dir
            .as_deref()
            .context("No submissions directory configured: set `submissions_dir`")
    }

    /// Output folder, `grades` by default.
    pub fn grades_dir(&self) -> PathBuf {
        self.grades_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_GRADES_DIR))
    }

    /// Shared test suite for the runner.
    pub fn test_suite(&self) -> TestSuite {
        TestSuite {
            tests_dir: self.tests_dir.clone(),
            data_dir:  self.test_data_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_follow_source_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("grader.toml");
        std::fs::write(
            &path,
            r#"
            submissions_dir = "subs"
            source_path = "assignment"
            readme_path = "README.md"
            tests_dir = "tests"
            grades_dir = "/tmp/grades"

            [pipeline]
            max_concurrent_reviews = 8
            skip_llm = true
            "#,
        )
        .expect("write config");

        let config = GraderConfig::load(&path).expect("load config");
        let source = dir.path().join("assignment");

        assert_eq!(config.submissions_dir, Some(dir.path().join("subs")));
        assert_eq!(config.readme_path, Some(source.join("README.md")));
        assert_eq!(config.tests_dir, Some(source.join("tests")));
        assert_eq!(config.grades_dir, Some(PathBuf::from("/tmp/grades")));
        assert_eq!(config.pipeline.max_concurrent_reviews, 8);
        assert_eq!(config.pipeline.max_concurrent_submissions, 4);
        assert!(config.pipeline.skip_llm);
    }

    #[test]
    fn rubric_path_wins_over_readme() {
        let config = GraderConfig {
            readme_path: Some("README.md".into()),
            rubric_path: Some("rubric.toml".into()),
            ..GraderConfig::default()
        };
        assert_eq!(config.rubric_source().expect("source"), Path::new("rubric.toml"));
        assert!(GraderConfig::default().rubric_source().is_err());
    }

    #[test]
    fn sandboxed_isolation_from_toml() {
        let config: PipelineConfig = toml::from_str(
            r#"
            isolation = { kind = "sandboxed", wrapper = ["firejail", "--net=none"] }
            "#,
        )
        .expect("parse");
        assert_eq!(
            config.isolation,
            IsolationMode::Sandboxed {
                wrapper: vec!["firejail".into(), "--net=none".into()],
            }
        );
        assert_eq!(config.retry_policy().attempts(), 3);
    }
}
