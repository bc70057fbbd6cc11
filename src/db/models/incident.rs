//! Incident record data model.
//!
//! One row per confirmed anomaly occurrence. Transient anomalies that clear
//! before their confirmation delay never produce a row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::incidents::AnomalyKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub id: String,
    pub device_id: String,
    pub anomaly: AnomalyKind,
    /// First detection, not the moment confirmation completed.
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub start_evidence_path: Option<PathBuf>,
    pub start_evidence_ref: Option<String>,
    pub end_evidence_path: Option<PathBuf>,
    pub end_evidence_ref: Option<String>,
    pub confirmed: bool,
    /// All local evidence for this incident has reached the upload sink.
    pub uploaded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    pub fn confirmed(
        device_id: &str,
        anomaly: AnomalyKind,
        started_at: DateTime<Utc>,
        start_evidence_path: Option<PathBuf>,
        now: DateTime<Utc>,
    ) -> Self {
        let uploaded = start_evidence_path.is_none();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            anomaly,
            started_at,
            ended_at: None,
            start_evidence_path,
            start_evidence_ref: None,
            end_evidence_path: None,
            end_evidence_ref: None,
            confirmed: true,
            uploaded,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}
