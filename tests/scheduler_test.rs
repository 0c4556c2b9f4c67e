use std::sync::Arc;
use std::time::Duration;

use harvester::models::{CreateJob, Job, JobStatus};
use harvester::scheduler::{Backpressure, Scheduler};
use harvester::store::{JobStore, MemoryStore};
use harvester::testing::{RecordingExecutor, wait_for_status};
use serde_json::json;

async fn queued(store: &MemoryStore, term: &str) -> Job {
    store
        .create_job(CreateJob {
            site: "marketplace".to_string(),
            input: json!({ "keywords": [term] }),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn jobs_run_side_by_side_up_to_the_width() {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(RecordingExecutor::new().blocking());
    let scheduler = Scheduler::new(store.clone(), executor.clone(), 2, Backpressure::Queue);

    let jobs = [
        queued(&store, "lamp").await,
        queued(&store, "desk").await,
        queued(&store, "chair").await,
    ];
    for job in &jobs {
        scheduler.submit(job.clone()).unwrap();
    }

    wait_for_status(store.as_ref(), jobs[0].id, JobStatus::Running).await;
    wait_for_status(store.as_ref(), jobs[1].id, JobStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        store.get_job(jobs[2].id).await.unwrap().unwrap().status,
        JobStatus::Queued
    );
    assert_eq!(executor.peak_active(), 2);

    // Freeing one slot lets the waiting job start.
    scheduler.cancel(jobs[0].id);
    wait_for_status(store.as_ref(), jobs[2].id, JobStatus::Running).await;

    assert_eq!(scheduler.cancel_all(), 2);
    for job in &jobs {
        wait_for_status(store.as_ref(), job.id, JobStatus::Aborted).await;
    }
}

#[tokio::test]
async fn cancelled_job_stops_logging_and_stays_aborted() {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(RecordingExecutor::new().blocking());
    let scheduler = Scheduler::new(store.clone(), executor, 2, Backpressure::Queue);

    let job = queued(&store, "lamp").await;
    scheduler.submit(job.clone()).unwrap();
    wait_for_status(store.as_ref(), job.id, JobStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(scheduler.cancel(job.id));
    let aborted = wait_for_status(store.as_ref(), job.id, JobStatus::Aborted).await;
    assert!(aborted.finished_at.is_some());
    assert_eq!(aborted.result_count, 0);

    let logs = store.logs(job.id).await.unwrap();
    assert_eq!(logs.last().map(|l| l.message.as_str()), Some("Job cancelled"));
    let settled = store.log_count(job.id);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.log_count(job.id), settled);

    assert!(store.records(job.id).await.unwrap().is_empty());
    assert!(!scheduler.is_active(job.id));
    assert!(!scheduler.cancel(job.id));
}

#[tokio::test]
async fn result_count_matches_stored_records() {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(RecordingExecutor::new().returning(7).with_delay(Duration::from_millis(10)));
    let scheduler = Scheduler::new(store.clone(), executor, 4, Backpressure::Queue);

    let first = queued(&store, "lamp").await;
    let second = queued(&store, "desk").await;
    scheduler.submit(first.clone()).unwrap();
    scheduler.submit(second.clone()).unwrap();

    for job in [&first, &second] {
        let done = wait_for_status(store.as_ref(), job.id, JobStatus::Succeeded).await;
        let records = store.records(job.id).await.unwrap();
        assert_eq!(done.result_count, records.len() as i64);
        assert_eq!(done.result_count, 7);
    }
}

#[tokio::test]
async fn terminal_job_cannot_be_resubmitted() {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(RecordingExecutor::new().returning(1));
    let scheduler = Scheduler::new(store.clone(), executor.clone(), 1, Backpressure::Queue);

    let job = queued(&store, "lamp").await;
    scheduler.submit(job.clone()).unwrap();
    let done = wait_for_status(store.as_ref(), job.id, JobStatus::Succeeded).await;

    assert!(scheduler.submit(done).is_err());
    assert_eq!(executor.executions(), 1);
}
