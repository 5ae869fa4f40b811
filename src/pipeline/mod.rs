#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

/// Which submissions already have a terminal record.
pub mod manifest;
/// Bounded, resumable grading of a whole submission set.
pub mod orchestrator;
/// Durable storage of grade records.
pub mod store;

pub use manifest::RunManifest;
pub use orchestrator::{CancelSignal, Orchestrator, PipelineError};
pub use store::{JsonRecordStore, PersistenceError, RecordStore};
