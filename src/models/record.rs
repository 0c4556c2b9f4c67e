use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output of one successful detail extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub candidate_id: String,
    pub search_term: String,
    pub source_url: String,
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Fields whose rules all failed, kept so selector drift is visible.
    pub missing_fields: Vec<String>,
    /// Share of declared fields that produced a value, in `0.0..=1.0`.
    pub completeness: f32,
}

impl ExtractedRecord {
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|v| v.as_f64())
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct StoredRecord {
    pub id: i64,
    pub job_id: Uuid,
    pub candidate_id: String,
    pub search_term: String,
    pub source_url: String,
    pub fields: serde_json::Value,
    pub missing_fields: Vec<String>,
    pub completeness: f32,
    pub created_at: DateTime<Utc>,
}
