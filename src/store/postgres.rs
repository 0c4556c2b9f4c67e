use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::job::JobRow;
use crate::models::{
    CreateJob, ExtractedRecord, Job, JobLogEntry, JobStatus, Proxy, ProxyEndpoint, StatusUpdate,
    StoredRecord,
};
use crate::store::{JobStore, ProxyStore};

const ALL_STATUSES: [JobStatus; 5] = [
    JobStatus::Queued,
    JobStatus::Running,
    JobStatus::Succeeded,
    JobStatus::Failed,
    JobStatus::Aborted,
];

/// Postgres-backed job and proxy store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Statuses a job may currently hold for `next` to be a legal transition.
fn allowed_predecessors(next: JobStatus) -> Vec<String> {
    ALL_STATUSES
        .iter()
        .filter(|s| s.can_transition_to(next))
        .map(|s| s.as_str().to_string())
        .collect()
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, input: CreateJob) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "INSERT INTO jobs (id, site, input) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&input.site)
        .bind(&input.input)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = $1 ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn set_status(&self, id: Uuid, update: StatusUpdate) -> Result<bool, StoreError> {
        // The status guard keeps terminal jobs immutable even under racing writers.
        let result = sqlx::query(
            "UPDATE jobs SET status = $2,
                 error_message = COALESCE($3, error_message),
                 result_count = COALESCE($4, result_count),
                 started_at = COALESCE($5, started_at),
                 finished_at = COALESCE($6, finished_at)
             WHERE id = $1 AND status = ANY($7)",
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(&update.error_message)
        .bind(update.result_count)
        .bind(update.started_at)
        .bind(update.finished_at)
        .bind(allowed_predecessors(update.status))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_log(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO job_logs (job_id, message) VALUES ($1, $2)")
            .bind(id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn logs(&self, id: Uuid) -> Result<Vec<JobLogEntry>, StoreError> {
        let entries = sqlx::query_as::<_, JobLogEntry>(
            "SELECT job_id, message, logged_at FROM job_logs WHERE job_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn insert_records(
        &self,
        id: Uuid,
        records: &[ExtractedRecord],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for record in records {
            let fields = serde_json::to_value(&record.fields)?;
            let result = sqlx::query(
                "INSERT INTO job_records (job_id, candidate_id, search_term, source_url, fields, missing_fields, completeness) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(id)
            .bind(&record.candidate_id)
            .bind(&record.search_term)
            .bind(&record.source_url)
            .bind(fields)
            .bind(&record.missing_fields)
            .bind(record.completeness)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn records(&self, id: Uuid) -> Result<Vec<ExtractedRecord>, StoreError> {
        let rows = sqlx::query_as::<_, StoredRecord>(
            "SELECT * FROM job_records WHERE job_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ExtractedRecord {
                    candidate_id: row.candidate_id,
                    search_term: row.search_term,
                    source_url: row.source_url,
                    fields: serde_json::from_value(row.fields)?,
                    missing_fields: row.missing_fields,
                    completeness: row.completeness,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ProxyStore for PgStore {
    async fn active_proxies(&self) -> Result<Vec<Proxy>, StoreError> {
        let proxies = sqlx::query_as::<_, Proxy>(
            "SELECT * FROM proxies WHERE is_active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(proxies)
    }

    async fn all_proxies(&self) -> Result<Vec<Proxy>, StoreError> {
        let proxies = sqlx::query_as::<_, Proxy>("SELECT * FROM proxies ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(proxies)
    }

    async fn insert_proxy(&self, endpoint: &ProxyEndpoint) -> Result<Proxy, StoreError> {
        let proxy = sqlx::query_as::<_, Proxy>(
            "INSERT INTO proxies (host, port, protocol, username, password) VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (host, port, protocol) DO UPDATE SET username = EXCLUDED.username, password = EXCLUDED.password
             RETURNING *",
        )
        .bind(&endpoint.host)
        .bind(endpoint.port)
        .bind(&endpoint.protocol)
        .bind(&endpoint.username)
        .bind(&endpoint.password)
        .fetch_one(&self.pool)
        .await?;
        Ok(proxy)
    }

    async fn touch_last_used(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE proxies SET last_used = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_success(
        &self,
        id: i64,
        response_time: Option<f64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE proxies SET success_count = success_count + 1, response_time = COALESCE($2, response_time), last_check = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(response_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, id: i64, threshold: i64) -> Result<bool, StoreError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "UPDATE proxies SET failure_count = failure_count + 1,
                 is_active = CASE WHEN failure_count + 1 >= $2 THEN FALSE ELSE is_active END,
                 last_check = NOW()
             WHERE id = $1
             RETURNING is_active",
        )
        .bind(id)
        .bind(threshold)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((is_active,)) => Ok(!is_active),
            None => Err(StoreError::NotFound(format!("Proxy {id} not found"))),
        }
    }

    async fn deactivate(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE proxies SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
