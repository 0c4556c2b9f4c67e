use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, SubmitError};
use crate::models::{CreateJob, ExtractedRecord, Job, JobLogEntry, JobStatus, StatusUpdate};
use crate::routes::api::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub logs: Vec<JobLogEntry>,
}

async fn load(state: &AppState, id: Uuid) -> Result<Job, AppError> {
    state
        .job_store
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Job>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let jobs = state.job_store.list_jobs(limit).await?;
    Ok(Json(jobs))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetail>, AppError> {
    let job = load(&state, id).await?;
    let logs = state.job_store.logs(id).await?;
    Ok(Json(JobDetail { job, logs }))
}

pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<CreateJob>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    if state.registry.get(&input.site).is_none() {
        return Err(AppError::BadRequest(format!(
            "Unknown site '{}', expected one of: {}",
            input.site,
            state.registry.sites().join(", ")
        )));
    }

    let job = state.job_store.create_job(input).await?;
    if let Err(e) = state.scheduler.submit(job.clone()) {
        if matches!(e, SubmitError::AtCapacity { .. }) {
            state
                .job_store
                .set_status(job.id, StatusUpdate::aborted(e.to_string()))
                .await?;
        }
        return Err(e.into());
    }

    tracing::info!(job_id = %job.id, site = %job.site, "Job submitted");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn records(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ExtractedRecord>>, AppError> {
    load(&state, id).await?;
    let records = state.job_store.records(id).await?;
    Ok(Json(records))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let job = load(&state, id).await?;
    if job.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "Job {id} is {}, nothing to cancel",
            job.status
        )));
    }

    // A queued job with no live unit (e.g. rejected at submit) is aborted directly.
    let cancelled = state.scheduler.cancel(id)
        || (job.status == JobStatus::Queued
            && state
                .job_store
                .set_status(id, StatusUpdate::aborted("cancelled by request"))
                .await?);
    if !cancelled {
        return Err(AppError::Conflict(format!("Job {id} has no active execution")));
    }

    tracing::info!(job_id = %id, "Cancellation requested");
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

pub async fn sites(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.sites())
}
