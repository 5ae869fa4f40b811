#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Bounded, resumable grading of a submission set.
//!
//! The orchestrator is the only writer of the record store. Workers grade
//! and hand their record back over the join set; the orchestrator loop
//! persists each terminal record as it arrives.

use std::{
    any::Any,
    collections::{BTreeMap, HashSet, VecDeque},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use bon::Builder;
use futures::FutureExt;
use thiserror::Error;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinSet,
};

use super::{
    manifest::RunManifest,
    store::{PersistenceError, RecordStore},
};
use crate::{
    grade::{GradeError, GradeRecord, SubmissionWorkflow},
    rubric::{Rubric, RubricError},
    submission::Submission,
};

/// Run-level failures. Either aborts the whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The rubric failed validation; nothing was dispatched.
    #[error("invalid rubric: {0}")]
    Rubric(#[from] RubricError),
    /// A record could not be persisted; the run stopped.
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Cooperative cancellation for a run.
///
/// Cancelling stops new dispatches; submissions already being graded finish
/// and are persisted.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    /// Shared sender; `true` once cancelled.
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// A signal that has not fired.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver notified when the signal fires.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Grades many submissions with bounded concurrency.
#[derive(Builder)]
pub struct Orchestrator {
    /// Workflow shared by all workers.
    #[builder(into)]
    workflow:       Arc<SubmissionWorkflow>,
    /// Durable record storage.
    store:          Arc<dyn RecordStore>,
    /// Submissions graded at once.
    #[builder(default = 4)]
    max_concurrent: usize,
    /// Cancellation signal.
    #[builder(default)]
    cancel:         CancelSignal,
}

/// Best-effort text of a panic payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Orchestrator {
    /// Handle to this run's cancellation signal.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Grades `submissions` against `rubric`.
    ///
    /// Submissions whose `existing` record is complete for the current rubric
    /// version are returned verbatim without grading, unless that record was
    /// graded without reviews and this run reviews. Every submission yields
    /// exactly one record; results are sorted by submission id.
    pub async fn run(
        &self,
        submissions: Vec<Submission>,
        rubric: &Rubric,
        existing: &[GradeRecord],
    ) -> Result<Vec<GradeRecord>, PipelineError> {
        rubric.validate()?;
        let version = rubric.version();
        let mut manifest = RunManifest::from_records(&version, existing);
        let reviewing = self.workflow.reviews_enabled();

        let mut results: BTreeMap<String, GradeRecord> = BTreeMap::new();
        let mut queue = VecDeque::new();
        for submission in submissions {
            let reusable = manifest
                .is_reusable(&submission.student_id, reviewing)
                .then(|| {
                    existing.iter().find(|r| {
                        r.submission_id == submission.student_id && r.rubric_version == version
                    })
                })
                .flatten();
            match reusable {
                Some(record) => {
                    results.insert(submission.student_id.clone(), record.clone());
                }
                None => queue.push_back(submission),
            }
        }

        let to_grade = queue.len();
        tracing::info!(
            rubric_version = %version,
            reused = results.len(),
            to_grade,
            "starting grading run"
        );

        let rubric = Arc::new(rubric.clone());
        let permits = Arc::new(Semaphore::new(self.max_concurrent.max(1)));
        let mut tasks: JoinSet<GradeRecord> = JoinSet::new();
        let mut inflight: HashSet<String> = HashSet::new();
        let mut cancel_rx = self.cancel.subscribe();
        let mut watching = true;
        let mut cancelled = false;
        let mut finished = 0usize;

        loop {
            while !cancelled && !queue.is_empty() {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    break;
                };
                let Some(submission) = queue.pop_front() else {
                    break;
                };

                inflight.insert(submission.student_id.clone());
                let workflow = Arc::clone(&self.workflow);
                let rubric = Arc::clone(&rubric);
                let version = version.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let graded = AssertUnwindSafe(workflow.grade(&submission, &rubric))
                        .catch_unwind()
                        .await;
                    graded.unwrap_or_else(|payload| {
                        let message = panic_message(payload);
                        tracing::error!(
                            student = %submission.student_id,
                            panic = %message,
                            "grading panicked"
                        );
                        GradeRecord::failed(
                            &submission.student_id,
                            version,
                            rubric.total_points,
                            GradeError::Fault(message).into_issue(),
                        )
                    })
                });
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok(record)) => {
                            inflight.remove(&record.submission_id);
                            finished += 1;
                            tracing::info!(
                                student = %record.submission_id,
                                status = %record.status,
                                total = record.total_points,
                                "[{finished}/{to_grade}] graded"
                            );
                            if let Err(e) = self.store.save(&record).await {
                                tracing::error!(error = %e, "could not persist record; stopping run");
                                return Err(e.into());
                            }
                            manifest.record(&record);
                            results.insert(record.submission_id.clone(), record);
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "grading task failed to join");
                        }
                        None => {}
                    }
                }
                changed = cancel_rx.changed(), if watching && !cancelled => {
                    match changed {
                        Ok(()) if *cancel_rx.borrow() => {
                            tracing::warn!(
                                undispatched = queue.len(),
                                "cancellation requested; finishing in-flight submissions"
                            );
                            cancelled = true;
                        }
                        Ok(()) => {}
                        Err(_) => watching = false,
                    }
                }
            }
        }

        // Tasks that failed to join still owe a record.
        for id in inflight {
            let record = GradeRecord::failed(
                &id,
                &version,
                rubric.total_points,
                GradeError::Fault("grading task ended without a result".into()).into_issue(),
            );
            self.store.save(&record).await?;
            results.insert(id, record);
        }

        for submission in queue {
            results.insert(
                submission.student_id.clone(),
                GradeRecord::pending(&submission.student_id, &version, rubric.total_points),
            );
        }

        tracing::info!(
            complete = manifest.complete_count(),
            records = results.len(),
            "grading run finished"
        );
        Ok(results.into_values().collect())
    }
}
