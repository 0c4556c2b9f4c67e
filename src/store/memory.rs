use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CreateJob, ExtractedRecord, Job, JobLogEntry, JobStatus, Proxy, ProxyEndpoint, StatusUpdate,
};
use crate::store::{JobStore, ProxyStore};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    job_order: Vec<Uuid>,
    logs: Vec<JobLogEntry>,
    records: HashMap<Uuid, Vec<ExtractedRecord>>,
    proxies: Vec<Proxy>,
    next_proxy_id: i64,
}

/// In-process store with the same transition and increment semantics as
/// `PgStore`. Each call takes the lock once, so updates are atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn log_count(&self, id: Uuid) -> usize {
        self.lock().logs.iter().filter(|l| l.job_id == id).count()
    }

    pub fn proxy(&self, id: i64) -> Option<Proxy> {
        self.lock().proxies.iter().find(|p| p.id == id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, input: CreateJob) -> Result<Job, StoreError> {
        let job = Job {
            id: Uuid::new_v4(),
            site: input.site,
            input: input.input,
            status: JobStatus::Queued,
            result_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let mut inner = self.lock();
        inner.job_order.push(job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock();
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(inner
            .job_order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect())
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .job_order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| job.status == status)
            .cloned()
            .collect())
    }

    async fn set_status(&self, id: Uuid, update: StatusUpdate) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("Job {id} not found")))?;

        if !job.status.can_transition_to(update.status) {
            return Ok(false);
        }

        job.status = update.status;
        if update.error_message.is_some() {
            job.error_message = update.error_message;
        }
        if let Some(count) = update.result_count {
            job.result_count = count;
        }
        if update.started_at.is_some() {
            job.started_at = update.started_at;
        }
        if update.finished_at.is_some() {
            job.finished_at = update.finished_at;
        }
        Ok(true)
    }

    async fn append_log(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.jobs.contains_key(&id) {
            return Err(StoreError::NotFound(format!("Job {id} not found")));
        }
        inner.logs.push(JobLogEntry {
            job_id: id,
            message: message.to_string(),
            logged_at: Utc::now(),
        });
        Ok(())
    }

    async fn logs(&self, id: Uuid) -> Result<Vec<JobLogEntry>, StoreError> {
        Ok(self
            .lock()
            .logs
            .iter()
            .filter(|l| l.job_id == id)
            .cloned()
            .collect())
    }

    async fn insert_records(
        &self,
        id: Uuid,
        records: &[ExtractedRecord],
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        inner
            .records
            .entry(id)
            .or_default()
            .extend(records.iter().cloned());
        Ok(records.len() as u64)
    }

    async fn records(&self, id: Uuid) -> Result<Vec<ExtractedRecord>, StoreError> {
        Ok(self.lock().records.get(&id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    async fn active_proxies(&self) -> Result<Vec<Proxy>, StoreError> {
        Ok(self
            .lock()
            .proxies
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    async fn all_proxies(&self) -> Result<Vec<Proxy>, StoreError> {
        Ok(self.lock().proxies.clone())
    }

    async fn insert_proxy(&self, endpoint: &ProxyEndpoint) -> Result<Proxy, StoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.proxies.iter_mut().find(|p| {
            p.host == endpoint.host && p.port == endpoint.port && p.protocol == endpoint.protocol
        }) {
            existing.username = endpoint.username.clone();
            existing.password = endpoint.password.clone();
            return Ok(existing.clone());
        }

        inner.next_proxy_id += 1;
        let proxy = Proxy {
            id: inner.next_proxy_id,
            host: endpoint.host.clone(),
            port: endpoint.port,
            protocol: endpoint.protocol.clone(),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            is_active: true,
            success_count: 0,
            failure_count: 0,
            response_time: None,
            last_used: None,
            last_check: None,
            created_at: Utc::now(),
        };
        inner.proxies.push(proxy.clone());
        Ok(proxy)
    }

    async fn touch_last_used(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let proxy = find_proxy(&mut inner, id)?;
        proxy.last_used = Some(Utc::now());
        Ok(())
    }

    async fn record_success(
        &self,
        id: i64,
        response_time: Option<f64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let proxy = find_proxy(&mut inner, id)?;
        proxy.success_count += 1;
        if response_time.is_some() {
            proxy.response_time = response_time;
        }
        proxy.last_check = Some(Utc::now());
        Ok(())
    }

    async fn record_failure(&self, id: i64, threshold: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let proxy = find_proxy(&mut inner, id)?;
        proxy.failure_count += 1;
        proxy.last_check = Some(Utc::now());
        if proxy.failure_count >= threshold {
            proxy.is_active = false;
        }
        Ok(!proxy.is_active)
    }

    async fn deactivate(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        find_proxy(&mut inner, id)?.is_active = false;
        Ok(())
    }
}

fn find_proxy(inner: &mut Inner, id: i64) -> Result<&mut Proxy, StoreError> {
    inner
        .proxies
        .iter_mut()
        .find(|p| p.id == id)
        .ok_or_else(|| StoreError::NotFound(format!("Proxy {id} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(site: &str) -> CreateJob {
        CreateJob {
            site: site.to_string(),
            input: serde_json::json!({ "keywords": ["lamp"] }),
        }
    }

    #[tokio::test]
    async fn terminal_job_is_immutable() {
        let store = MemoryStore::new();
        let job = store.create_job(create("marketplace")).await.unwrap();

        assert!(store.set_status(job.id, StatusUpdate::running()).await.unwrap());
        assert!(store.set_status(job.id, StatusUpdate::succeeded(3)).await.unwrap());
        assert!(!store.set_status(job.id, StatusUpdate::failed("late")).await.unwrap());
        assert!(!store.set_status(job.id, StatusUpdate::running()).await.unwrap());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.result_count, 3);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn failure_threshold_deactivates() {
        let store = MemoryStore::new();
        let endpoint = ProxyEndpoint::parse("10.0.0.1:8080").unwrap();
        let proxy = store.insert_proxy(&endpoint).await.unwrap();

        for _ in 0..4 {
            assert!(!store.record_failure(proxy.id, 5).await.unwrap());
        }
        assert!(store.record_failure(proxy.id, 5).await.unwrap());
        assert!(store.active_proxies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reimport_keeps_identity() {
        let store = MemoryStore::new();
        let first = store
            .insert_proxy(&ProxyEndpoint::parse("http://a:b@10.0.0.2:3128").unwrap())
            .await
            .unwrap();
        let second = store
            .insert_proxy(&ProxyEndpoint::parse("http://c:d@10.0.0.2:3128").unwrap())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.username.as_deref(), Some("c"));
        assert_eq!(store.all_proxies().await.unwrap().len(), 1);
    }
}
