mod common;

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use common::*;
use graderpod::{
    grade::{ErrorKind, GradeStatus},
    pipeline::{CancelSignal, JsonRecordStore, Orchestrator, PipelineError, RecordStore},
    rubric::Rubric,
};

fn passing() -> Run {
    Run::Report(vec![("test_a", true)])
}

fn standard_rubric() -> Rubric {
    rubric(vec![
        test_criterion("q1", 10.0, &["test_a"]),
        llm_criterion("discussion", 10.0),
    ])
}

fn orchestrator(
    executor: Arc<FakeExecutor>,
    reviewer: Arc<FakeReviewer>,
    store: Arc<dyn RecordStore>,
    max_concurrent: usize,
) -> Orchestrator {
    Orchestrator::builder()
        .workflow(workflow(executor, Some(reviewer), fast_policy(2)))
        .store(store)
        .max_concurrent(max_concurrent)
        .build()
}

#[tokio::test]
async fn every_submission_yields_one_record_sorted_by_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let subs = submissions(dir.path(), &["carol", "alice", "bob"]);
    let store = Arc::new(MemoryStore::default());
    let executor = Arc::new(FakeExecutor::new(passing()));
    let reviewer = Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok")));

    let records = orchestrator(executor.clone(), reviewer, store.clone(), 2)
        .run(subs, &standard_rubric(), &[])
        .await
        .expect("run");

    let ids: Vec<&str> = records.iter().map(|r| r.submission_id.as_str()).collect();
    assert_eq!(ids, vec!["alice", "bob", "carol"]);
    assert!(records.iter().all(|r| r.status == GradeStatus::Complete));
    assert!(records.iter().all(|r| r.total_points == 16.0));
    assert_eq!(store.saves(), 3);
    assert_eq!(executor.calls(), 3);
}

#[tokio::test]
async fn rerun_reuses_complete_records_without_calling_clients() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rubric = standard_rubric();
    let store = Arc::new(MemoryStore::default());

    let first_exec = Arc::new(FakeExecutor::new(passing()));
    let first_review = Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok")));
    let first = orchestrator(first_exec, first_review, store.clone(), 2)
        .run(submissions(dir.path(), &["alice", "bob"]), &rubric, &[])
        .await
        .expect("first run");

    let existing = store.load(&rubric.version()).await.expect("load");
    let executor = Arc::new(FakeExecutor::new(passing()));
    let reviewer = Arc::new(FakeReviewer::new(Verdict::Award(1.0, "different")));
    let second = orchestrator(executor.clone(), reviewer.clone(), store.clone(), 2)
        .run(submissions(dir.path(), &["alice", "bob"]), &rubric, &existing)
        .await
        .expect("second run");

    assert_eq!(second, first);
    assert_eq!(executor.calls(), 0);
    assert_eq!(reviewer.calls(), 0);
    assert_eq!(store.saves(), 2);
}

#[tokio::test(start_paused = true)]
async fn partial_records_are_regraded_on_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rubric = standard_rubric();
    let store = Arc::new(MemoryStore::default());

    let flaky = Arc::new(FakeReviewer::new(Verdict::Hang));
    let first = orchestrator(
        Arc::new(FakeExecutor::new(passing())),
        flaky,
        store.clone(),
        1,
    )
    .run(submissions(dir.path(), &["alice"]), &rubric, &[])
    .await
    .expect("first run");
    assert_eq!(first[0].status, GradeStatus::Partial);

    let existing = store.load(&rubric.version()).await.expect("load");
    let reviewer = Arc::new(FakeReviewer::new(Verdict::Award(9.0, "recovered")));
    let second = orchestrator(
        Arc::new(FakeExecutor::new(passing())),
        reviewer.clone(),
        store.clone(),
        1,
    )
    .run(submissions(dir.path(), &["alice"]), &rubric, &existing)
    .await
    .expect("second run");

    assert_eq!(reviewer.calls(), 1);
    assert_eq!(second[0].status, GradeStatus::Complete);
    assert_eq!(second[0].total_points, 19.0);
}

#[tokio::test]
async fn records_graded_without_reviews_are_regraded_when_reviews_are_on() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rubric = standard_rubric();
    let store = Arc::new(MemoryStore::default());

    let first = Orchestrator::builder()
        .workflow(workflow(
            Arc::new(FakeExecutor::new(passing())),
            None,
            fast_policy(2),
        ))
        .store(store.clone() as Arc<dyn RecordStore>)
        .build()
        .run(submissions(dir.path(), &["alice"]), &rubric, &[])
        .await
        .expect("tests-only run");
    assert_eq!(first[0].status, GradeStatus::Complete);
    assert!(first[0].llm_skipped);
    assert!(first[0].score("discussion").is_none());

    let existing = store.load(&rubric.version()).await.expect("load");
    let reviewer = Arc::new(FakeReviewer::new(Verdict::Award(8.0, "thorough")));
    let second = orchestrator(
        Arc::new(FakeExecutor::new(passing())),
        reviewer.clone(),
        store.clone(),
        2,
    )
    .run(submissions(dir.path(), &["alice"]), &rubric, &existing)
    .await
    .expect("reviewed run");

    assert_eq!(reviewer.calls(), 1);
    assert!(!second[0].llm_skipped);
    assert_eq!(second[0].score("discussion").expect("discussion").awarded, 8.0);
    assert_eq!(second[0].total_points, 18.0);

    let existing = store.load(&rubric.version()).await.expect("reload");
    let executor = Arc::new(FakeExecutor::new(passing()));
    let third = Orchestrator::builder()
        .workflow(workflow(executor.clone(), None, fast_policy(2)))
        .store(store.clone() as Arc<dyn RecordStore>)
        .build()
        .run(submissions(dir.path(), &["alice"]), &rubric, &existing)
        .await
        .expect("tests-only rerun");

    assert_eq!(executor.calls(), 0);
    assert_eq!(third, second);
}

#[tokio::test]
async fn records_for_another_rubric_version_are_not_reused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::default());
    let old_rubric = rubric(vec![test_criterion("q1", 10.0, &["test_a"])]);
    orchestrator(
        Arc::new(FakeExecutor::new(passing())),
        Arc::new(FakeReviewer::new(Verdict::Award(5.0, "ok"))),
        store.clone(),
        1,
    )
    .run(submissions(dir.path(), &["alice"]), &old_rubric, &[])
    .await
    .expect("first run");

    let existing = store.load(&old_rubric.version()).await.expect("load");
    let executor = Arc::new(FakeExecutor::new(passing()));
    let new_rubric = standard_rubric();
    let records = orchestrator(
        executor.clone(),
        Arc::new(FakeReviewer::new(Verdict::Award(5.0, "ok"))),
        store,
        1,
    )
    .run(submissions(dir.path(), &["alice"]), &new_rubric, &existing)
    .await
    .expect("second run");

    assert_eq!(executor.calls(), 1);
    assert_eq!(records[0].rubric_version, new_rubric.version());
}

#[tokio::test]
async fn a_panicking_submission_does_not_affect_the_others() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::default());
    let executor = Arc::new(FakeExecutor::new(passing()).with("bob", Run::Panic));
    let reviewer = Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok")));

    let records = orchestrator(executor, reviewer, store.clone(), 3)
        .run(
            submissions(dir.path(), &["alice", "bob", "carol"]),
            &standard_rubric(),
            &[],
        )
        .await
        .expect("run");

    assert_eq!(records.len(), 3);
    let bob = &records[1];
    assert_eq!(bob.submission_id, "bob");
    assert_eq!(bob.status, GradeStatus::Failed);
    assert_eq!(bob.errors[0].kind, ErrorKind::Internal);
    assert!(bob.errors[0].message.contains("runner exploded"));
    assert_eq!(records[0].status, GradeStatus::Complete);
    assert_eq!(records[2].status, GradeStatus::Complete);
    assert_eq!(store.saves(), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_the_bound() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::default());
    let executor = Arc::new(FakeExecutor::new(passing()).with_delay(Duration::from_secs(1)));
    let reviewer = Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok")));

    let records = orchestrator(executor.clone(), reviewer, store, 2)
        .run(
            submissions(dir.path(), &["a", "b", "c", "d", "e"]),
            &standard_rubric(),
            &[],
        )
        .await
        .expect("run");

    assert_eq!(records.len(), 5);
    assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn reviews_stay_within_their_own_bound_across_submissions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rubric = rubric(vec![
        llm_criterion("analysis", 10.0),
        llm_criterion("discussion", 10.0),
    ]);
    let executor = Arc::new(FakeExecutor::new(passing()));
    let reviewer = Arc::new(
        FakeReviewer::new(Verdict::Award(6.0, "ok")).with_delay(Duration::from_secs(1)),
    );

    let records = Orchestrator::builder()
        .workflow(workflow_with_review_bound(
            executor,
            Some(reviewer.clone()),
            fast_policy(2),
            3,
        ))
        .store(Arc::new(MemoryStore::default()) as Arc<dyn RecordStore>)
        .max_concurrent(6)
        .build()
        .run(
            submissions(dir.path(), &["a", "b", "c", "d", "e", "f"]),
            &rubric,
            &[],
        )
        .await
        .expect("run");

    assert!(records.iter().all(|r| r.status == GradeStatus::Complete));
    assert_eq!(reviewer.calls(), 12);
    assert_eq!(reviewer.peak(), 3);
}

#[tokio::test]
async fn cancellation_finishes_in_flight_work_and_leaves_the_rest_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::default());
    let cancel = CancelSignal::new();
    let executor = Arc::new(FakeExecutor::new(passing()).cancelling(cancel.clone()));
    let reviewer = Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok")));

    let records = Orchestrator::builder()
        .workflow(workflow(executor.clone(), Some(reviewer), fast_policy(2)))
        .store(store.clone() as Arc<dyn RecordStore>)
        .max_concurrent(1)
        .cancel(cancel)
        .build()
        .run(
            submissions(dir.path(), &["alice", "bob", "carol"]),
            &standard_rubric(),
            &[],
        )
        .await
        .expect("run");

    assert_eq!(executor.calls(), 1);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].status, GradeStatus::Complete);
    assert_eq!(records[1].status, GradeStatus::Pending);
    assert_eq!(records[2].status, GradeStatus::Pending);
    assert_eq!(store.saves(), 1);
}

#[tokio::test]
async fn cancelling_before_the_run_dispatches_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::default());
    let executor = Arc::new(FakeExecutor::new(passing()));
    let orchestrator = orchestrator(
        executor.clone(),
        Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok"))),
        store.clone(),
        2,
    );
    orchestrator.cancel_signal().cancel();

    let records = orchestrator
        .run(submissions(dir.path(), &["alice", "bob"]), &standard_rubric(), &[])
        .await
        .expect("run");

    assert!(records.iter().all(|r| r.status == GradeStatus::Pending));
    assert_eq!(executor.calls(), 0);
    assert_eq!(store.saves(), 0);
}

#[tokio::test]
async fn persistence_failure_aborts_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let result = orchestrator(
        Arc::new(FakeExecutor::new(passing())),
        Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok"))),
        Arc::new(MemoryStore::failing()),
        1,
    )
    .run(submissions(dir.path(), &["alice", "bob"]), &standard_rubric(), &[])
    .await;

    assert!(matches!(result, Err(PipelineError::Persistence(_))));
}

#[tokio::test]
async fn invalid_rubric_is_rejected_before_dispatch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = Arc::new(FakeExecutor::new(passing()));
    let mut bad = standard_rubric();
    bad.total_points = 25.0;

    let result = orchestrator(
        executor.clone(),
        Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok"))),
        Arc::new(MemoryStore::default()),
        1,
    )
    .run(submissions(dir.path(), &["alice"]), &bad, &[])
    .await;

    assert!(matches!(result, Err(PipelineError::Rubric(_))));
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn resumes_from_records_on_disk() {
    let subs_dir = tempfile::tempdir().expect("tempdir");
    let grades_dir = tempfile::tempdir().expect("tempdir");
    let rubric = standard_rubric();
    let store = Arc::new(JsonRecordStore::new(grades_dir.path()));

    orchestrator(
        Arc::new(FakeExecutor::new(passing())),
        Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok"))),
        store.clone(),
        2,
    )
    .run(submissions(subs_dir.path(), &["alice", "bob"]), &rubric, &[])
    .await
    .expect("first run");

    let on_disk = store.load(&rubric.version()).await.expect("load");
    assert_eq!(on_disk.len(), 2);
    assert!(
        store
            .version_dir(&rubric.version())
            .join("alice.json")
            .is_file()
    );

    let executor = Arc::new(FakeExecutor::new(passing()));
    let records = orchestrator(
        executor.clone(),
        Arc::new(FakeReviewer::new(Verdict::Award(6.0, "ok"))),
        store,
        2,
    )
    .run(
        submissions(subs_dir.path(), &["alice", "bob", "carol"]),
        &rubric,
        &on_disk,
    )
    .await
    .expect("second run");

    assert_eq!(executor.calls(), 1);
    assert_eq!(records.len(), 3);
    assert_eq!(&records[..2], &on_disk[..]);
}
