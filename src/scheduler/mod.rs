//! Job task scheduler.
//!
//! Every accepted job runs as its own detached task, bounded by a semaphore
//! of configurable width. The scheduler owns the job state machine: it marks
//! the job running, hands it to the executor, and writes exactly one terminal
//! status (with the number of records actually stored) when the unit ends,
//! whether it finished, failed, panicked or was cancelled.

pub mod progress;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{PipelineError, StoreError, SubmitError};
use crate::models::{ExtractedRecord, Job, JobStatus, StatusUpdate};
use crate::store::JobStore;

pub use progress::{ProgressSink, StoreProgressSink};

/// The unit of work a job is bound to.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Input checks that must pass before the job may become `running`.
    /// Must not perform any I/O.
    fn validate(&self, job: &Job) -> Result<(), PipelineError>;

    async fn execute(
        &self,
        job: &Job,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Vec<ExtractedRecord>, PipelineError>;
}

/// What to do with a submission when every slot is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Accept and keep the job `queued` until a slot frees up.
    #[default]
    Queue,
    /// Refuse the submission.
    Reject,
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
    progress: Arc<dyn ProgressSink>,
    permits: Arc<Semaphore>,
    width: usize,
    backpressure: Backpressure,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        width: usize,
        backpressure: Backpressure,
    ) -> Self {
        let width = width.max(1);
        Self {
            progress: Arc::new(StoreProgressSink::new(store.clone())),
            store,
            executor,
            permits: Arc::new(Semaphore::new(width)),
            width,
            backpressure,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    fn units(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch `job` as an independent unit. Returns once the unit is
    /// scheduled, never after it finishes.
    pub fn submit(&self, job: Job) -> Result<(), SubmitError> {
        if job.status != JobStatus::Queued {
            return Err(SubmitError::NotQueued {
                id: job.id,
                status: job.status.to_string(),
            });
        }

        let token = CancellationToken::new();
        let permit = {
            let mut units = self.units();
            if units.contains_key(&job.id) {
                return Err(SubmitError::AlreadyRunning(job.id));
            }
            let permit = match self.backpressure {
                Backpressure::Queue => None,
                Backpressure::Reject => match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => return Err(SubmitError::AtCapacity { width: self.width }),
                },
            };
            units.insert(job.id, token.clone());
            permit
        };

        let unit = JobUnit {
            store: self.store.clone(),
            executor: self.executor.clone(),
            progress: self.progress.clone(),
            permits: self.permits.clone(),
            running: self.running.clone(),
            token,
        };
        let span = tracing::info_span!("job", job_id = %job.id, site = %job.site);
        tokio::spawn(unit.run(job, permit).instrument(span));
        Ok(())
    }

    /// Signal a queued or running unit to stop. `false` if no unit exists.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.units().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every unit, e.g. on shutdown.
    pub fn cancel_all(&self) -> usize {
        let units = self.units();
        for token in units.values() {
            token.cancel();
        }
        units.len()
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.units().contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.units().len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Reconcile jobs left over from a previous process: anything still
    /// `running` lost its unit and is failed, anything `queued` is submitted
    /// again. Returns how many jobs were resubmitted.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        for job in self.store.jobs_with_status(JobStatus::Running).await? {
            tracing::warn!(job_id = %job.id, "Failing job interrupted by restart");
            self.store
                .set_status(job.id, StatusUpdate::failed("interrupted by restart"))
                .await?;
        }

        let mut resubmitted = 0;
        for job in self.store.jobs_with_status(JobStatus::Queued).await? {
            let id = job.id;
            match self.submit(job) {
                Ok(()) => resubmitted += 1,
                Err(e) => tracing::warn!(job_id = %id, "Could not resubmit queued job: {e}"),
            }
        }
        if resubmitted > 0 {
            tracing::info!("Resubmitted {resubmitted} queued jobs");
        }
        Ok(resubmitted)
    }
}

/// Everything one detached unit needs, owned so the task is `'static`.
struct JobUnit {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
    progress: Arc<dyn ProgressSink>,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    token: CancellationToken,
}

enum Finish {
    Completed(Vec<ExtractedRecord>),
    Failed(String),
    Cancelled,
}

impl JobUnit {
    async fn run(self, job: Job, permit: Option<OwnedSemaphorePermit>) {
        let id = job.id;
        self.drive(job, permit).await;
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    async fn drive(&self, job: Job, permit: Option<OwnedSemaphorePermit>) {
        if let Err(e) = self.executor.validate(&job) {
            tracing::warn!("Job rejected before start: {e}");
            self.finish(&job, Finish::Failed(e.to_string())).await;
            return;
        }

        let _permit = match permit {
            Some(permit) => permit,
            None => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        self.finish(&job, Finish::Cancelled).await;
                        return;
                    }
                    permit = self.permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.finish(&job, Finish::Failed("scheduler shut down".to_string())).await;
                            return;
                        }
                    },
                }
            }
        };

        match self.store.set_status(job.id, StatusUpdate::running()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Job is no longer queued, not starting it");
                return;
            }
            Err(e) => {
                tracing::error!("Failed to mark job running: {e}");
                return;
            }
        }
        self.progress.report(job.id, "Job started").await;

        let work = AssertUnwindSafe(self.executor.execute(&job, self.progress.clone())).catch_unwind();
        let finish = tokio::select! {
            biased;
            _ = self.token.cancelled() => Finish::Cancelled,
            result = work => match result {
                Ok(Ok(records)) => Finish::Completed(records),
                Ok(Err(e)) => Finish::Failed(e.to_string()),
                Err(panic) => Finish::Failed(format!("execution panicked: {}", panic_message(&*panic))),
            },
        };
        self.finish(&job, finish).await;
    }

    /// The single terminal write for this unit.
    async fn finish(&self, job: &Job, finish: Finish) {
        let update = match finish {
            Finish::Completed(records) => match self.store.insert_records(job.id, &records).await {
                Ok(written) => {
                    let count = i64::try_from(written).unwrap_or(i64::MAX);
                    self.progress
                        .report(job.id, &format!("Job succeeded with {count} records"))
                        .await;
                    StatusUpdate::succeeded(count)
                }
                Err(e) => {
                    tracing::error!("Failed to store records: {e}");
                    StatusUpdate::failed(format!("failed to store records: {e}"))
                }
            },
            Finish::Failed(message) => {
                tracing::warn!("Job failed: {message}");
                self.progress
                    .report(job.id, &format!("Job failed: {message}"))
                    .await;
                StatusUpdate::failed(message)
            }
            Finish::Cancelled => {
                // Partial records are discarded; the log entry precedes the status flip.
                tracing::info!("Job cancelled");
                self.progress.report(job.id, "Job cancelled").await;
                StatusUpdate::aborted("cancelled by request")
            }
        };

        match self.store.set_status(job.id, update).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Terminal status not applied, job already terminal"),
            Err(e) => tracing::error!("Failed to write terminal status: {e}"),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::models::CreateJob;
    use crate::store::MemoryStore;
    use crate::testing::{RecordingExecutor, wait_for_status};

    async fn queued(store: &MemoryStore) -> Job {
        store
            .create_job(CreateJob {
                site: "marketplace".to_string(),
                input: json!({ "keywords": ["lamp"] }),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn completed_job_stores_records_and_count() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new().returning(3));
        let scheduler = Scheduler::new(store.clone(), executor, 4, Backpressure::Queue);

        let job = queued(&store).await;
        scheduler.submit(job.clone()).unwrap();
        let done = wait_for_status(store.as_ref(), job.id, JobStatus::Succeeded).await;

        assert_eq!(done.result_count, 3);
        assert_eq!(store.records(job.id).await.unwrap().len(), 3);
        assert!(done.started_at.is_some() && done.finished_at.is_some());
        assert!(done.error_message.is_none());
    }

    #[tokio::test]
    async fn invalid_job_never_runs() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new().invalid("missing required field 'keywords'"));
        let scheduler = Scheduler::new(store.clone(), executor.clone(), 4, Backpressure::Queue);

        let job = queued(&store).await;
        scheduler.submit(job.clone()).unwrap();
        let done = wait_for_status(store.as_ref(), job.id, JobStatus::Failed).await;

        assert!(done.error_message.unwrap().contains("keywords"));
        assert!(done.started_at.is_none());
        assert_eq!(executor.executions(), 0);
    }

    #[tokio::test]
    async fn duplicate_submission_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new().blocking());
        let scheduler = Scheduler::new(store.clone(), executor, 4, Backpressure::Queue);

        let job = queued(&store).await;
        scheduler.submit(job.clone()).unwrap();
        assert!(matches!(
            scheduler.submit(job.clone()),
            Err(SubmitError::AlreadyRunning(id)) if id == job.id
        ));
        assert!(scheduler.cancel(job.id));
        wait_for_status(store.as_ref(), job.id, JobStatus::Aborted).await;
    }

    #[tokio::test]
    async fn reject_policy_refuses_when_full() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new().blocking());
        let scheduler = Scheduler::new(store.clone(), executor, 1, Backpressure::Reject);

        let first = queued(&store).await;
        let second = queued(&store).await;
        scheduler.submit(first.clone()).unwrap();
        assert!(matches!(
            scheduler.submit(second.clone()),
            Err(SubmitError::AtCapacity { width: 1 })
        ));

        scheduler.cancel(first.id);
        wait_for_status(store.as_ref(), first.id, JobStatus::Aborted).await;
        scheduler.submit(second.clone()).unwrap();
        scheduler.cancel(second.id);
        wait_for_status(store.as_ref(), second.id, JobStatus::Aborted).await;
    }

    #[tokio::test]
    async fn queue_policy_holds_jobs_until_a_slot_frees() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new().blocking());
        let scheduler = Scheduler::new(store.clone(), executor.clone(), 1, Backpressure::Queue);

        let first = queued(&store).await;
        let second = queued(&store).await;
        scheduler.submit(first.clone()).unwrap();
        scheduler.submit(second.clone()).unwrap();
        wait_for_status(store.as_ref(), first.id, JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            store.get_job(second.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );

        // Cancelling a queued job aborts it without it ever running.
        scheduler.cancel(second.id);
        let aborted = wait_for_status(store.as_ref(), second.id, JobStatus::Aborted).await;
        assert!(aborted.started_at.is_none());
        scheduler.cancel(first.id);
        wait_for_status(store.as_ref(), first.id, JobStatus::Aborted).await;
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test]
    async fn panicking_unit_is_recorded_as_failed() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new().panicking("selector table exploded"));
        let scheduler = Scheduler::new(store.clone(), executor, 2, Backpressure::Queue);

        let job = queued(&store).await;
        scheduler.submit(job.clone()).unwrap();
        let done = wait_for_status(store.as_ref(), job.id, JobStatus::Failed).await;
        assert!(done.error_message.unwrap().contains("selector table exploded"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!scheduler.is_active(job.id));
    }

    #[tokio::test]
    async fn recovery_fails_stale_runs_and_resubmits_queued() {
        let store = Arc::new(MemoryStore::new());
        let stale = queued(&store).await;
        store.set_status(stale.id, StatusUpdate::running()).await.unwrap();
        let waiting = queued(&store).await;

        let executor = Arc::new(RecordingExecutor::new().returning(1));
        let scheduler = Scheduler::new(store.clone(), executor.clone(), 2, Backpressure::Queue);
        assert_eq!(scheduler.recover().await.unwrap(), 1);

        let failed = wait_for_status(store.as_ref(), stale.id, JobStatus::Failed).await;
        assert_eq!(failed.error_message.as_deref(), Some("interrupted by restart"));
        wait_for_status(store.as_ref(), waiting.id, JobStatus::Succeeded).await;
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test]
    async fn non_queued_jobs_are_not_submitted() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(RecordingExecutor::new()),
            2,
            Backpressure::Queue,
        );
        let mut job = queued(&store).await;
        job.status = JobStatus::Succeeded;
        assert!(matches!(scheduler.submit(job), Err(SubmitError::NotQueued { .. })));
        assert!(!scheduler.cancel(Uuid::new_v4()));
    }
}
