use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::path::PathBuf;

use crate::db::{
    connection::Database,
    helpers::{parse_anomaly, parse_datetime, parse_optional_datetime, path_to_sql},
    models::Incident,
};

const SELECT_COLUMNS: &str = "SELECT id, device_id, anomaly, started_at, ended_at,
        start_evidence_path, start_evidence_ref, end_evidence_path, end_evidence_ref,
        confirmed, uploaded, created_at, updated_at
    FROM incidents";

// Recomputed on every write that touches evidence columns.
const UPLOADED_EXPR: &str = "(start_evidence_path IS NULL OR start_evidence_ref IS NOT NULL)
    AND (end_evidence_path IS NULL OR end_evidence_ref IS NOT NULL)";

fn row_to_incident(row: &Row) -> Result<Incident> {
    let anomaly: String = row.get("anomaly")?;
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let start_evidence_path: Option<String> = row.get("start_evidence_path")?;
    let end_evidence_path: Option<String> = row.get("end_evidence_path")?;

    Ok(Incident {
        id: row.get("id")?,
        device_id: row.get("device_id")?,
        anomaly: parse_anomaly(&anomaly)?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_optional_datetime(ended_at, "ended_at")?,
        start_evidence_path: start_evidence_path.map(PathBuf::from),
        start_evidence_ref: row.get("start_evidence_ref")?,
        end_evidence_path: end_evidence_path.map(PathBuf::from),
        end_evidence_ref: row.get("end_evidence_ref")?,
        confirmed: row.get("confirmed")?,
        uploaded: row.get("uploaded")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    pub async fn insert_incident(&self, incident: &Incident) -> Result<()> {
        let record = incident.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO incidents (
                    id, device_id, anomaly, started_at, ended_at,
                    start_evidence_path, start_evidence_ref, end_evidence_path, end_evidence_ref,
                    confirmed, uploaded, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.id,
                    record.device_id,
                    record.anomaly.as_str(),
                    record.started_at.to_rfc3339(),
                    record.ended_at.as_ref().map(|dt| dt.to_rfc3339()),
                    path_to_sql(record.start_evidence_path.as_ref()),
                    record.start_evidence_ref,
                    path_to_sql(record.end_evidence_path.as_ref()),
                    record.end_evidence_ref,
                    record.confirmed,
                    record.uploaded,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert incident")?;
            Ok(())
        })
        .await
    }

    pub async fn close_incident(
        &self,
        incident_id: &str,
        ended_at: DateTime<Utc>,
        end_evidence_path: Option<PathBuf>,
    ) -> Result<()> {
        let incident_id = incident_id.to_string();
        let set_flag = format!("UPDATE incidents SET uploaded = {UPLOADED_EXPR} WHERE id = ?1");
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE incidents
                 SET ended_at = ?1,
                     end_evidence_path = ?2,
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    ended_at.to_rfc3339(),
                    path_to_sql(end_evidence_path.as_ref()),
                    Utc::now().to_rfc3339(),
                    incident_id,
                ],
            )
            .with_context(|| "failed to close incident")?;
            tx.execute(&set_flag, params![incident_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn mark_start_uploaded(&self, incident_id: &str, remote_ref: &str) -> Result<()> {
        self.set_evidence_ref(incident_id, "start_evidence_ref", remote_ref)
            .await
    }

    pub async fn mark_end_uploaded(&self, incident_id: &str, remote_ref: &str) -> Result<()> {
        self.set_evidence_ref(incident_id, "end_evidence_ref", remote_ref)
            .await
    }

    async fn set_evidence_ref(
        &self,
        incident_id: &str,
        column: &'static str,
        remote_ref: &str,
    ) -> Result<()> {
        let incident_id = incident_id.to_string();
        let remote_ref = remote_ref.to_string();
        // SQLite evaluates SET expressions against the old row, so the new
        // ref is folded into the uploaded flag in a second statement.
        let set_ref = format!("UPDATE incidents SET {column} = ?1, updated_at = ?2 WHERE id = ?3");
        let set_flag = format!("UPDATE incidents SET uploaded = {UPLOADED_EXPR} WHERE id = ?1");
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &set_ref,
                params![remote_ref, Utc::now().to_rfc3339(), incident_id],
            )
            .with_context(|| format!("failed to record {column}"))?;
            tx.execute(&set_flag, params![incident_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>> {
        let incident_id = incident_id.to_string();
        self.execute(move |conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let row = stmt
                .query_row(params![incident_id], |row| {
                    Ok(row_to_incident(row))
                })
                .optional()?;
            row.transpose()
        })
        .await
    }

    /// Incidents with local evidence that has not reached the sink yet.
    pub async fn list_pending_uploads(&self) -> Result<Vec<Incident>> {
        self.execute(move |conn| {
            let sql = format!(
                "{SELECT_COLUMNS}
                 WHERE (start_evidence_path IS NOT NULL AND start_evidence_ref IS NULL)
                    OR (end_evidence_path IS NOT NULL AND end_evidence_ref IS NULL)
                 ORDER BY started_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut incidents = Vec::new();
            while let Some(row) = rows.next()? {
                incidents.push(row_to_incident(row)?);
            }
            Ok(incidents)
        })
        .await
    }

    /// Incidents still waiting for their anomaly to clear.
    pub async fn get_open_incidents(&self) -> Result<Vec<Incident>> {
        self.list_incidents(None, true).await
    }

    pub async fn list_incidents(
        &self,
        device_id: Option<String>,
        open_only: bool,
    ) -> Result<Vec<Incident>> {
        self.execute(move |conn| {
            let mut sql = format!("{SELECT_COLUMNS} WHERE (?1 IS NULL OR device_id = ?1)");
            if open_only {
                sql.push_str(" AND ended_at IS NULL");
            }
            sql.push_str(" ORDER BY started_at ASC");

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![device_id])?;
            let mut incidents = Vec::new();
            while let Some(row) = rows.next()? {
                incidents.push(row_to_incident(row)?);
            }
            Ok(incidents)
        })
        .await
    }
}
