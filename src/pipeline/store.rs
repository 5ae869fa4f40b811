#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::{constants::RECORDS_DIR, grade::GradeRecord};

/// Failures of the record store. Fatal to a run.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Writing a record failed.
    #[error("could not write {path}: {source}")]
    Write {
        /// Target path.
        path:   PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Reading records failed.
    #[error("could not read {path}: {source}")]
    Read {
        /// Source path.
        path:   PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A record could not be serialized.
    #[error("could not encode record `{id}`: {source}")]
    Encode {
        /// Submission id.
        id:     String,
        /// Serializer error.
        #[source]
        source: serde_json::Error,
    },
    /// A stored record is not valid JSON.
    #[error("could not decode {path}: {source}")]
    Decode {
        /// Source path.
        path:   PathBuf,
        /// Deserializer error.
        #[source]
        source: serde_json::Error,
    },
}

/// Durable storage of grade records, keyed by rubric version and submission
/// id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every stored record for `rubric_version`.
    async fn load(&self, rubric_version: &str) -> Result<Vec<GradeRecord>, PersistenceError>;

    /// Stores `record`, replacing any previous record for the same key.
    async fn save(&self, record: &GradeRecord) -> Result<(), PersistenceError>;
}

/// Stores each record as `<root>/records/<rubric_version>/<submission_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    /// Grades directory.
    root: PathBuf,
}

impl JsonRecordStore {
    /// Store rooted at the grades directory `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding records of `rubric_version`.
    pub fn version_dir(&self, rubric_version: &str) -> PathBuf {
        self.root.join(RECORDS_DIR).join(rubric_version)
    }

    /// Path of one record.
    fn record_path(&self, record: &GradeRecord) -> PathBuf {
        self.version_dir(&record.rubric_version)
            .join(format!("{}.json", record.submission_id))
    }
}

/// Maps an I/O error to a write failure at `path`.
fn write_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn load(&self, rubric_version: &str) -> Result<Vec<GradeRecord>, PersistenceError> {
        let dir = self.version_dir(rubric_version);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(PersistenceError::Read { path: dir, source }),
        };

        let mut records = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(PersistenceError::Read {
                        path: dir.clone(),
                        source,
                    });
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| PersistenceError::Read {
                    path: path.clone(),
                    source,
                })?;
            let record: GradeRecord = serde_json::from_slice(&bytes)
                .map_err(|source| PersistenceError::Decode { path, source })?;
            records.push(record);
        }

        records.sort_by(|a, b| a.submission_id.cmp(&b.submission_id));
        Ok(records)
    }

    async fn save(&self, record: &GradeRecord) -> Result<(), PersistenceError> {
        let path = self.record_path(record);
        let dir = self.version_dir(&record.rubric_version);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(write_err(&dir))?;

        let json = serde_json::to_vec_pretty(record).map_err(|source| PersistenceError::Encode {
            id: record.submission_id.clone(),
            source,
        })?;

        // Records are replaced atomically.
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(write_err(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(write_err(&path))?;

        tracing::debug!(path = %path.display(), "record saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grade::GradeStatus;

    #[tokio::test]
    async fn round_trips_records_per_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonRecordStore::new(dir.path());

        let mut alice = GradeRecord::pending("alice", "v1", 10.0);
        alice.status = GradeStatus::Complete;
        alice.total_points = 9.0;
        store.save(&alice).await.expect("save alice");
        store
            .save(&GradeRecord::pending("bob", "v2", 10.0))
            .await
            .expect("save bob");

        let loaded = store.load("v1").await.expect("load v1");
        assert_eq!(loaded, vec![alice]);
        assert!(store.load("v3").await.expect("load v3").is_empty());
    }
}
