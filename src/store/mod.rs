//! Seams to the external persistence layer.
//!
//! The engine never owns storage format; it only issues the calls below.
//! `PgStore` is the production implementation, `MemoryStore` backs tests and
//! database-less runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CreateJob, ExtractedRecord, Job, JobLogEntry, JobStatus, Proxy, ProxyEndpoint, StatusUpdate,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, input: CreateJob) -> Result<Job, StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Jobs currently in `status`, oldest first.
    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    /// Apply a status transition. Returns `false` when the job was already
    /// terminal (or the transition is otherwise illegal) and nothing changed.
    async fn set_status(&self, id: Uuid, update: StatusUpdate) -> Result<bool, StoreError>;

    async fn append_log(&self, id: Uuid, message: &str) -> Result<(), StoreError>;

    async fn logs(&self, id: Uuid) -> Result<Vec<JobLogEntry>, StoreError>;

    /// Persist records for a job, returning how many were written.
    async fn insert_records(
        &self,
        id: Uuid,
        records: &[ExtractedRecord],
    ) -> Result<u64, StoreError>;

    async fn records(&self, id: Uuid) -> Result<Vec<ExtractedRecord>, StoreError>;
}

/// Proxy persistence. Every mutation is a single increment-style update so
/// concurrent probes and uses never lose counts.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Active proxies in stable store order.
    async fn active_proxies(&self) -> Result<Vec<Proxy>, StoreError>;

    async fn all_proxies(&self) -> Result<Vec<Proxy>, StoreError>;

    async fn insert_proxy(&self, endpoint: &ProxyEndpoint) -> Result<Proxy, StoreError>;

    async fn touch_last_used(&self, id: i64) -> Result<(), StoreError>;

    async fn record_success(
        &self,
        id: i64,
        response_time: Option<f64>,
    ) -> Result<(), StoreError>;

    /// Increment the failure count and deactivate once it reaches `threshold`.
    /// Returns whether the proxy is now inactive.
    async fn record_failure(&self, id: i64, threshold: i64) -> Result<bool, StoreError>;

    async fn deactivate(&self, id: i64) -> Result<(), StoreError>;
}
