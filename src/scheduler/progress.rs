use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::JobStore;

/// Receives pipeline milestones. Delivery is at-least-once and best effort:
/// a failing sink never fails the job.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, job_id: Uuid, message: &str);
}

/// Appends every milestone to the job's log in the store.
pub struct StoreProgressSink {
    store: Arc<dyn JobStore>,
}

impl StoreProgressSink {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProgressSink for StoreProgressSink {
    async fn report(&self, job_id: Uuid, message: &str) {
        tracing::info!("{message}");
        if let Err(e) = self.store.append_log(job_id, message).await {
            tracing::warn!("Failed to append log for job {job_id}: {e}");
        }
    }
}
