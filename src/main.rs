#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! # graderpod
//! ## Introduction
//!
//! Grades a folder of student submissions against an assignment rubric by
//! running the shared pytest suite and asking an LLM to review the criteria
//! tests cannot judge.
//!
//! ## Usage
//!
//! Put a `grader.toml` next to the submissions folder (or pass `--config`),
//! set `OPENAI_API_KEY` in the environment or a `.env` file, and run
//! `graderpod grade`. Re-running resumes: students already graded against the
//! same rubric are not graded again. `graderpod summary` shows the last
//! results without grading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bpaf::*;
use dotenvy::dotenv;
use graderpod::{
    aggregate::report::{ResultSet, overview_table, record_table},
    app::{grade_all, load_results, load_rubric},
    config::GraderConfig,
    constants::DEFAULT_CONFIG_FILENAME,
    grade::GradeStatus,
    pipeline::CancelSignal,
};
use tracing::{Level, metadata::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, util::SubscriberInitExt};

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
struct Overrides {
    /// Submissions folder
    submissions: Option<PathBuf>,
    /// Structured rubric
    rubric:      Option<PathBuf>,
    /// Assignment README
    readme:      Option<PathBuf>,
    /// Shared pytest files
    tests:       Option<PathBuf>,
    /// Output folder
    grades:      Option<PathBuf>,
    /// Grade with tests only
    skip_llm:    bool,
    /// Submissions graded at once
    jobs:        Option<usize>,
}

impl Overrides {
    /// Writes every given value into `config`.
    fn apply(self, config: &mut GraderConfig) {
        if let Some(dir) = self.submissions {
            config.submissions_dir = Some(dir);
        }
        if let Some(path) = self.rubric {
            config.rubric_path = Some(path);
        }
        if let Some(path) = self.readme {
            config.readme_path = Some(path);
        }
        if let Some(dir) = self.tests {
            config.tests_dir = Some(dir);
        }
        if let Some(dir) = self.grades {
            config.grades_dir = Some(dir);
        }
        if let Some(jobs) = self.jobs {
            config.pipeline.max_concurrent_submissions = jobs;
        }
        config.pipeline.skip_llm |= self.skip_llm;
    }
}

/// Top-level CLI commands.
#[derive(Debug, Clone)]
enum Cmd {
    /// Grade every submission
    Grade(Overrides),
    /// Show persisted results
    Summary(Overrides),
    /// Print the parsed rubric
    Rubric(Overrides),
}

/// Parsed command line.
#[derive(Debug, Clone)]
struct Opts {
    /// Config file path
    config:  Option<PathBuf>,
    /// Debug-level logging
    verbose: bool,
    /// Command to run
    cmd:     Cmd,
}

/// Parse the command line arguments and return the options
fn options() -> Opts {
    /// parses the rubric path
    fn rubric() -> impl Parser<Option<PathBuf>> {
        long("rubric")
            .help("Structured rubric file (TOML or JSON)")
            .argument::<PathBuf>("PATH")
            .optional()
    }

    /// parses the README path
    fn readme() -> impl Parser<Option<PathBuf>> {
        long("readme")
            .help("Assignment README to parse as a rubric")
            .argument::<PathBuf>("PATH")
            .optional()
    }

    /// parses the grades directory
    fn grades() -> impl Parser<Option<PathBuf>> {
        long("grades")
            .help("Output folder for records and summaries")
            .argument::<PathBuf>("DIR")
            .optional()
    }

    let grade = {
        let submissions = long("submissions")
            .short('s')
            .help("Folder with one sub-folder per student")
            .argument::<PathBuf>("DIR")
            .optional();
        let rubric = rubric();
        let readme = readme();
        let tests = long("tests")
            .help("Folder of shared pytest files")
            .argument::<PathBuf>("DIR")
            .optional();
        let grades = grades();
        let skip_llm = long("skip-llm")
            .help("Grade with tests only")
            .switch();
        let jobs = long("jobs")
            .short('j')
            .help("Submissions graded at once")
            .argument::<usize>("N")
            .optional();

        construct!(Overrides {
            submissions,
            rubric,
            readme,
            tests,
            grades,
            skip_llm,
            jobs
        })
        .map(Cmd::Grade)
        .to_options()
        .command("grade")
        .help("Grade every submission and write the results")
    };

    let summary = grades()
        .map(|grades| {
            Cmd::Summary(Overrides {
                grades,
                ..Overrides::default()
            })
        })
        .to_options()
        .command("summary")
        .help("Show the last results without grading");

    let show_rubric = {
        let rubric = rubric();
        let readme = readme();
        construct!(rubric, readme)
            .map(|(rubric, readme)| {
                Cmd::Rubric(Overrides {
                    rubric,
                    readme,
                    ..Overrides::default()
                })
            })
            .to_options()
            .command("rubric")
            .help("Print the parsed rubric as JSON")
    };

    let config = long("config")
        .short('c')
        .help("Path to grader.toml")
        .argument::<PathBuf>("PATH")
        .optional();
    let verbose = long("verbose")
        .short('v')
        .help("Enable debug logging")
        .switch();
    let cmd = construct!([grade, summary, show_rubric]);

    construct!(Opts {
        config,
        verbose,
        cmd
    })
    .to_options()
    .descr("Grading pipeline for programming assignments")
    .run()
}

/// Loads `path`, else `grader.toml` from the working directory if present,
/// else defaults.
fn load_config(path: Option<&Path>) -> Result<GraderConfig> {
    match path {
        Some(path) => GraderConfig::load(path),
        None if Path::new(DEFAULT_CONFIG_FILENAME).is_file() => {
            GraderConfig::load(Path::new(DEFAULT_CONFIG_FILENAME))
        }
        None => Ok(GraderConfig::default()),
    }
}

/// Prints the class overview, and each record when `detailed`.
fn show(results: &ResultSet, detailed: bool) {
    if detailed {
        for record in &results.records {
            if record.status != GradeStatus::Pending {
                println!("{}", record_table(record));
            }
        }
    }

    println!("{}", overview_table(results));

    for record in &results.records {
        for issue in &record.errors {
            eprintln!("{}: {}", record.submission_id, issue.message);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let opts = options();
    let mut config = load_config(opts.config.as_deref())?;
    let overrides = match &opts.cmd {
        Cmd::Grade(o) | Cmd::Summary(o) | Cmd::Rubric(o) => o.clone(),
    };
    overrides.apply(&mut config);
    config.verbose |= opts.verbose;
    config.pipeline.apply_env_overrides();

    let fmt = fmt::layer()
        .without_time()
        .with_file(false)
        .with_line_number(false);
    let level = if config.verbose { Level::DEBUG } else { Level::INFO };
    let filter_layer = LevelFilter::from_level(level);
    tracing_subscriber::registry()
        .with(fmt)
        .with(filter_layer)
        .init();

    match opts.cmd {
        Cmd::Grade(_) if config.only_dashboard => {
            let results = load_results(&config)?;
            show(&results, config.verbose);
        }
        Cmd::Grade(_) => {
            let cancel = CancelSignal::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted; waiting for in-flight submissions to finish");
                    on_interrupt.cancel();
                }
            });

            let results = grade_all(&config, cancel).await?;
            show(&results, config.verbose);
        }
        Cmd::Summary(_) => {
            let results = load_results(&config)?;
            show(&results, config.verbose);
        }
        Cmd::Rubric(_) => {
            let rubric = load_rubric(&config)?;
            let json =
                serde_json::to_string_pretty(&rubric).context("Could not serialize rubric")?;
            println!("{json}");
        }
    };

    Ok(())
}
