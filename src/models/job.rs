use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Aborted
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => next != JobStatus::Queued,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            _ => Err(StoreError::Corrupt(format!("invalid job status: {s}"))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One caller-submitted extraction request.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub site: String,
    pub input: serde_json::Value,
    pub status: JobStatus,
    pub result_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub site: String,
    pub input: serde_json::Value,
    pub status: String,
    pub result_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            site: row.site,
            input: row.input,
            status: row.status.parse()?,
            result_count: row.result_count,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJob {
    pub site: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// A status transition plus the fields that change with it.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub result_count: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            status: JobStatus::Running,
            error_message: None,
            result_count: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    pub fn succeeded(result_count: i64) -> Self {
        Self {
            status: JobStatus::Succeeded,
            error_message: None,
            result_count: Some(result_count),
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error_message: Some(error.into()),
            result_count: Some(0),
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Aborted,
            error_message: Some(reason.into()),
            result_count: Some(0),
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobLogEntry {
    pub job_id: Uuid,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}
