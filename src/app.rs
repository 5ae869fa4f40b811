#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Wires configuration, collaborators and the orchestrator into the runs the
//! command line exposes.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use itertools::Itertools;

use crate::{
    aggregate::report::ResultSet,
    config::{GraderConfig, OpenAiEnv},
    constants::RECORDS_DIR,
    execution::{ExecutionClient, pytest::PytestRunner},
    grade::{GradeRecord, SubmissionWorkflow},
    pipeline::{CancelSignal, JsonRecordStore, Orchestrator, RecordStore},
    review::{ReviewClient, openai::OpenAiReviewer, retry::ReviewGate},
    rubric::Rubric,
    submission::{ArtifactNames, discover_submissions},
    util::find_files,
};

/// Loads and validates the configured rubric.
pub fn load_rubric(config: &GraderConfig) -> Result<Rubric> {
    let source = config.rubric_source()?;
    let rubric = Rubric::load(source)
        .with_context(|| format!("Could not load rubric from {}", source.display()))?;
    rubric.validate().context("Rubric failed validation")?;
    Ok(rubric)
}

/// Review gate backed by the OpenAI reviewer, or `None` when LLM grading is
/// off or no credentials are available.
fn review_gate(config: &GraderConfig) -> Result<Option<ReviewGate>> {
    if config.pipeline.skip_llm {
        tracing::info!("LLM review disabled; grading with tests only");
        return Ok(None);
    }

    let Some(env) = OpenAiEnv::from_env() else {
        tracing::warn!("OPENAI_API_KEY is not set; falling back to test-only grading");
        return Ok(None);
    };

    tracing::debug!(model = env.model(), "using OpenAI reviewer");
    let client: Arc<dyn ReviewClient> = Arc::new(OpenAiReviewer::new(&env)?);
    Ok(Some(ReviewGate::new(
        client,
        config.pipeline.max_concurrent_reviews,
        config.pipeline.retry_policy(),
    )))
}

/// Grades every submission under the configured folder, resuming from
/// records already persisted for the current rubric version, and writes the
/// result set.
pub async fn grade_all(config: &GraderConfig, cancel: CancelSignal) -> Result<ResultSet> {
    let rubric = load_rubric(config)?;
    let version = rubric.version();
    tracing::info!(
        title = %rubric.title,
        criteria = rubric.criteria.len(),
        total = rubric.total_points,
        version = %version,
        "rubric loaded"
    );

    let submissions_dir = config.submissions_dir()?;
    let submissions = discover_submissions(submissions_dir, &ArtifactNames::default())?;
    if submissions.is_empty() {
        tracing::warn!(dir = %submissions_dir.display(), "no submissions found");
    }

    let grades_dir = config.grades_dir();
    let store = JsonRecordStore::new(&grades_dir);
    let existing = store
        .load(&version)
        .await
        .context("Could not read previously persisted records")?;

    let suite = config.test_suite();
    if rubric.needs_tests() && suite.tests_dir.is_none() && rubric.test_suite.is_none() {
        tracing::warn!("rubric references tests but no tests directory is configured");
    }

    let reviews = review_gate(config)?;
    let skip_llm = reviews.is_none();
    let executor: Arc<dyn ExecutionClient> = Arc::new(PytestRunner::new(config.python.clone()));

    let workflow = SubmissionWorkflow::builder()
        .executor(executor)
        .maybe_reviews(reviews)
        .suite(suite)
        .options(config.pipeline.run_options())
        .skip_llm(skip_llm)
        .execution_grace(config.pipeline.execution_grace())
        .build();

    let store: Arc<dyn RecordStore> = Arc::new(store);
    let orchestrator = Orchestrator::builder()
        .workflow(workflow)
        .store(store)
        .max_concurrent(config.pipeline.max_concurrent_submissions)
        .cancel(cancel)
        .build();

    let records = orchestrator.run(submissions, &rubric, &existing).await?;
    let results = ResultSet::new(&rubric, records);
    let (json, csv) = results.write(&grades_dir)?;
    tracing::info!(json = %json.display(), csv = %csv.display(), "results written");

    Ok(results)
}

/// Reads persisted results without grading.
///
/// Prefers the written summary; otherwise rebuilds one from the individual
/// records of the most recently graded rubric version.
pub fn load_results(config: &GraderConfig) -> Result<ResultSet> {
    let grades_dir = config.grades_dir();
    match ResultSet::load(&grades_dir) {
        Ok(mut results) => {
            results.reaggregate();
            Ok(results)
        }
        Err(e) => {
            tracing::debug!(error = %e, "no summary file; rebuilding from records");
            rebuild_from_records(&grades_dir)
        }
    }
}

/// Assembles a result set from `<grades_dir>/records/*/*.json`.
fn rebuild_from_records(grades_dir: &Path) -> Result<ResultSet> {
    let records_dir = grades_dir.join(RECORDS_DIR);
    let mut records = Vec::new();
    for path in find_files("json", 1, &records_dir)? {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let record: GradeRecord = serde_json::from_str(&content)
            .with_context(|| format!("Could not parse {}", path.display()))?;
        records.push(record);
    }

    let latest = records
        .iter()
        .max_by_key(|r| r.graded_at)
        .map(|r| r.rubric_version.clone())
        .with_context(|| format!("No grade records found under {}", records_dir.display()))?;

    let records = records
        .into_iter()
        .filter(|r| r.rubric_version == latest)
        .unique_by(|r| r.submission_id.clone())
        .collect();

    Ok(ResultSet::from_parts(latest, "Grades".to_string(), records))
}
