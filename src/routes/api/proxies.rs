use axum::Json;
use axum::extract::State;
use serde::Deserialize;

use crate::error::AppError;
use crate::models::{Proxy, ProxyEndpoint};
use crate::routes::api::AppState;

/// A proxy given either as a connection line or as structured fields.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ProxyInput {
    Line(String),
    Endpoint(ProxyEndpoint),
}

#[derive(Debug, Deserialize)]
pub struct ProxyBatch {
    pub proxies: Vec<ProxyInput>,
}

impl ProxyBatch {
    fn endpoints(self) -> Result<Vec<ProxyEndpoint>, AppError> {
        self.proxies
            .into_iter()
            .map(|input| match input {
                ProxyInput::Endpoint(endpoint) if endpoint.is_usable() => Ok(endpoint),
                ProxyInput::Endpoint(endpoint) => {
                    Err(AppError::BadRequest(format!("Invalid proxy '{endpoint}'")))
                }
                ProxyInput::Line(line) => ProxyEndpoint::parse(&line)
                    .ok_or_else(|| AppError::BadRequest(format!("Invalid proxy '{line}'"))),
            })
            .collect()
    }
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Proxy>>, AppError> {
    let proxies = state.proxies.list().await?;
    Ok(Json(proxies))
}

pub async fn import(
    State(state): State<AppState>,
    Json(batch): Json<ProxyBatch>,
) -> Result<Json<Vec<Proxy>>, AppError> {
    let endpoints = batch.endpoints()?;
    let imported = state.proxies.import(&endpoints).await?;
    Ok(Json(imported))
}

pub async fn discover(
    State(state): State<AppState>,
    Json(batch): Json<ProxyBatch>,
) -> Result<Json<serde_json::Value>, AppError> {
    let endpoints = batch.endpoints()?;
    let kept = state.proxies.discover(&endpoints).await?;
    Ok(Json(serde_json::json!({
        "candidates": endpoints.len(),
        "added": kept,
    })))
}

pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let healthy = state.proxies.health_check_all().await?;
    Ok(Json(serde_json::json!({ "healthy": healthy })))
}
