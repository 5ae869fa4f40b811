//! # graderpod
//!
//! A grading pipeline for programming assignments. Each submission is run
//! against a shared test suite and, for criteria that need judgement, scored
//! by an LLM reviewer; both signals are merged into one grade record per
//! student. Runs are bounded, resumable, and end in a class summary.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

/// Class statistics and the persisted result set
pub mod aggregate;
/// Wiring of configuration and collaborators into complete runs
pub mod app;
/// Configuration file and environment settings
pub mod config;
/// A module defining a bunch of constant values to be used throughout
pub mod constants;
/// Running the test suite against a submission
pub mod execution;
/// Grading one submission
pub mod grade;
/// Grading a whole submission set
pub mod pipeline;
/// Child processes with deadlines
pub mod process;
/// LLM review of criteria
pub mod review;
/// Rubric model, loading and validation
pub mod rubric;
/// Student submissions and their artifacts
pub mod submission;
/// Utility functions for convenience
pub mod util;
