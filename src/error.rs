use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uuid::Uuid;

use crate::pipeline::discovery::Diagnosis;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service busy: {0}")]
    Busy(String),
}

impl From<SubmitError> for AppError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::AtCapacity { .. } => AppError::Busy(e.to_string()),
            SubmitError::AlreadyRunning(_) | SubmitError::NotQueued { .. } => {
                AppError::Conflict(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Store(StoreError::NotFound(msg)) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Store(e) => {
                tracing::error!("Store error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Busy(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        };

        let body = axum::Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

/// Failures of the external job/proxy store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Failures while opening or driving a browsing session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("webdriver error: {0}")]
    Driver(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("session operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("no page loaded in session")]
    NoPage,
}

/// Why a single field could not be extracted from a page.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldError {
    #[error("no match after {tried} rule(s)")]
    NotFound { tried: usize },

    #[error("invalid selector '{0}'")]
    InvalidSelector(String),

    #[error("invalid capture pattern '{0}'")]
    InvalidPattern(String),

    #[error("could not parse '{value}' as {expected}")]
    Unparseable { value: String, expected: &'static str },
}

/// Job-level failures surfaced as the job's `error_message`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown site '{0}'")]
    UnknownSite(String),

    #[error(
        "discovery aborted after {pages} consecutive blocked pages on '{term}': probable anti-bot detection (CAPTCHA or block page)"
    )]
    Blocked { term: String, pages: u32 },

    #[error("no candidates found after {attempts} attempt(s): {diagnosis}")]
    NoCandidates { attempts: u32, diagnosis: Diagnosis },

    #[error("all {count} detail extractions failed; last error: {last_error}")]
    AllItemsFailed { count: usize, last_error: String },

    #[error("challenge on {url} could not be negotiated and policy is abort")]
    ChallengeAborted { url: String },

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Reasons the scheduler refuses to accept a job.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("job {0} already has an active execution unit")]
    AlreadyRunning(Uuid),

    #[error("scheduler at capacity ({width} jobs running)")]
    AtCapacity { width: usize },

    #[error("job {id} is {status}, only queued jobs can be submitted")]
    NotQueued { id: Uuid, status: String },
}
