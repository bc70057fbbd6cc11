use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::{Database, Incident};
use crate::layout::{copy_file, CaptureRoot, Category, HourClock};
use crate::settings::IncidentSettings;
use crate::upload::{EvidenceSlot, UploadJob, UploadQueue};

use super::state::{transition, IncidentAction, IncidentPhase};
use super::AnomalyKind;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Default)]
struct IncidentSlot {
    phase: IncidentPhase,
    /// First detection of the current occurrence.
    since: Option<DateTime<Utc>>,
    start_evidence: Option<PathBuf>,
    incident_id: Option<String>,
}

type SlotKey = (String, AnomalyKind);

/// Incident state per (device, anomaly), plus the side effects of each
/// transition: cold evidence copies, incident rows and uploads.
///
/// Every transition runs on its own task while holding its slot's lock, so a
/// caller that is dropped mid-transition never leaves a row without the
/// matching slot state. Cloning shares the slot table.
#[derive(Clone)]
pub struct IncidentManager {
    slots: Arc<StdMutex<HashMap<SlotKey, Arc<Mutex<IncidentSlot>>>>>,
    db: Database,
    uploads: UploadQueue,
    settings: IncidentSettings,
    clock: HourClock,
}

impl IncidentManager {
    pub fn new(
        db: Database,
        uploads: UploadQueue,
        settings: IncidentSettings,
        clock: HourClock,
    ) -> Self {
        Self {
            slots: Arc::new(StdMutex::new(HashMap::new())),
            db,
            uploads,
            settings,
            clock,
        }
    }

    fn slot(&self, device_id: &str, kind: AnomalyKind) -> Arc<Mutex<IncidentSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry((device_id.to_string(), kind)).or_default())
    }

    /// Reload incidents left open by a previous run so their resolution is
    /// still recorded.
    pub async fn restore_open(&self) -> Result<usize> {
        let open = self
            .db
            .get_open_incidents()
            .await
            .context("failed to load open incidents")?;
        for incident in &open {
            log_warn!(
                "Recovered open incident id={} device={} anomaly={} started_at={}",
                incident.id,
                incident.device_id,
                incident.anomaly,
                incident.started_at.to_rfc3339()
            );
            let slot = self.slot(&incident.device_id, incident.anomaly);
            *slot.lock().await = IncidentSlot {
                phase: IncidentPhase::Confirmed,
                since: Some(incident.started_at),
                start_evidence: incident.start_evidence_path.clone(),
                incident_id: Some(incident.id.clone()),
            };
        }
        Ok(open.len())
    }

    /// Waits for an in-flight transition on the same pair.
    pub async fn phase(&self, device_id: &str, kind: AnomalyKind) -> IncidentPhase {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(device_id.to_string(), kind))
            .cloned();
        match slot {
            Some(slot) => slot.lock().await.phase,
            None => IncidentPhase::None,
        }
    }

    /// Feed one frame's signal for `kind`. `evidence` is the hot file to keep
    /// if this frame starts or ends an occurrence.
    pub async fn observe(
        &self,
        root: &CaptureRoot,
        kind: AnomalyKind,
        active: bool,
        evidence: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Result<IncidentAction> {
        let mut guard = self.slot(&root.device_id, kind).lock_owned().await;
        let manager = self.clone();
        let device_id = root.device_id.clone();
        let root = root.clone();
        let evidence = evidence.map(Path::to_path_buf);

        tokio::spawn(async move {
            manager
                .advance(&mut guard, &root, kind, active, evidence.as_deref(), now)
                .await
        })
        .await
        .with_context(|| format!("{kind} transition task failed for {device_id}"))?
    }

    async fn advance(
        &self,
        stored: &mut IncidentSlot,
        root: &CaptureRoot,
        kind: AnomalyKind,
        active: bool,
        evidence: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Result<IncidentAction> {
        let mut slot = stored.clone();
        let delay = self.settings.delay_for(kind);
        let elapsed = slot
            .since
            .and_then(|since| now.signed_duration_since(since).to_std().ok())
            .unwrap_or(Duration::ZERO);

        let (mut next, mut action) = transition(slot.phase, active, elapsed, delay);

        let outcome = match action {
            IncidentAction::None => Ok(()),
            IncidentAction::PreserveEvidence => {
                self.suspect(root, kind, &mut slot, evidence, now).await;
                if delay.is_zero() {
                    (next, action) = transition(next, true, Duration::ZERO, delay);
                    self.confirm(root, kind, &mut slot, now).await
                } else {
                    Ok(())
                }
            }
            IncidentAction::DiscardEvidence => {
                self.dismiss(root, kind, &slot, now).await;
                Ok(())
            }
            IncidentAction::Confirm => self.confirm(root, kind, &mut slot, now).await,
            IncidentAction::Resolve => self.resolve(root, kind, &slot, evidence, now).await,
        };

        match outcome {
            Ok(()) => {
                if next == IncidentPhase::None {
                    *stored = IncidentSlot::default();
                } else {
                    slot.phase = next;
                    *stored = slot;
                }
                Ok(action)
            }
            Err(err) => {
                // Stay put so the next frame retries the same transition.
                if slot.phase == IncidentPhase::None && slot.since.is_some() {
                    slot.phase = IncidentPhase::Suspected;
                }
                *stored = slot;
                Err(err)
            }
        }
    }

    async fn suspect(
        &self,
        root: &CaptureRoot,
        kind: AnomalyKind,
        slot: &mut IncidentSlot,
        evidence: Option<&Path>,
        now: DateTime<Utc>,
    ) {
        slot.since = Some(now);
        slot.incident_id = None;
        slot.start_evidence = self.preserve(root, kind, "start", evidence, now).await;
        log_info!(
            "incident suspected device={} anomaly={} detected_at={} evidence={}",
            root.device_id,
            kind,
            now.to_rfc3339(),
            display_opt(slot.start_evidence.as_deref())
        );
    }

    async fn dismiss(
        &self,
        root: &CaptureRoot,
        kind: AnomalyKind,
        slot: &IncidentSlot,
        now: DateTime<Utc>,
    ) {
        if let Some(path) = slot.start_evidence.clone() {
            let removed = tokio::task::spawn_blocking(move || std::fs::remove_file(&path)).await;
            match removed {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {}
                Ok(Err(err)) => log_warn!("failed to discard transient evidence: {err}"),
                Err(err) => log_warn!("evidence discard worker join failed: {err}"),
            }
        }
        log_info!(
            "incident dismissed device={} anomaly={} detected_at={} cleared_at={}",
            root.device_id,
            kind,
            slot.since.map(|t| t.to_rfc3339()).unwrap_or_default(),
            now.to_rfc3339()
        );
    }

    async fn confirm(
        &self,
        root: &CaptureRoot,
        kind: AnomalyKind,
        slot: &mut IncidentSlot,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let started_at = slot.since.unwrap_or(now);
        let incident = Incident::confirmed(
            &root.device_id,
            kind,
            started_at,
            slot.start_evidence.clone(),
            now,
        );
        self.db
            .insert_incident(&incident)
            .await
            .with_context(|| format!("failed to record {kind} incident for {}", root.device_id))?;

        log_info!(
            "incident confirmed id={} device={} anomaly={} started_at={} confirmed_at={}",
            incident.id,
            root.device_id,
            kind,
            started_at.to_rfc3339(),
            now.to_rfc3339()
        );

        if let Some(path) = slot.start_evidence.clone() {
            self.uploads.enqueue(UploadJob {
                incident_id: incident.id.clone(),
                device_id: root.device_id.clone(),
                local_path: path,
                slot: EvidenceSlot::Start,
            });
        }
        slot.incident_id = Some(incident.id);
        Ok(())
    }

    async fn resolve(
        &self,
        root: &CaptureRoot,
        kind: AnomalyKind,
        slot: &IncidentSlot,
        evidence: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(incident_id) = slot.incident_id.clone() else {
            log_error!(
                "confirmed {} on {} has no incident id; dropping state",
                kind,
                root.device_id
            );
            return Ok(());
        };

        let end_evidence = self.preserve(root, kind, "end", evidence, now).await;
        self.db
            .close_incident(&incident_id, now, end_evidence.clone())
            .await
            .with_context(|| format!("failed to close incident {incident_id}"))?;

        log_info!(
            "incident resolved id={} device={} anomaly={} started_at={} ended_at={} duration_secs={}",
            incident_id,
            root.device_id,
            kind,
            slot.since.map(|t| t.to_rfc3339()).unwrap_or_default(),
            now.to_rfc3339(),
            slot.since
                .map(|t| now.signed_duration_since(t).num_seconds())
                .unwrap_or(0)
        );

        if let Some(path) = end_evidence {
            self.uploads.enqueue(UploadJob {
                incident_id,
                device_id: root.device_id.clone(),
                local_path: path,
                slot: EvidenceSlot::End,
            });
        }
        Ok(())
    }

    /// Copy `evidence` into the current hour's cold thumbnail bucket under an
    /// incident-specific name the archiver never produces.
    async fn preserve(
        &self,
        root: &CaptureRoot,
        kind: AnomalyKind,
        tag: &str,
        evidence: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Option<PathBuf> {
        let source = evidence?.to_path_buf();
        let name = source.file_name()?.to_str()?.to_string();
        let bucket = root.cold_bucket_dir(Category::Thumbnails, self.clock.hour_at(now));
        let target = bucket.join(format!("{}_{}_{}", kind.as_str(), tag, name));

        let (src, dst) = (source.clone(), target.clone());
        let copied = tokio::task::spawn_blocking(move || -> io::Result<()> {
            std::fs::create_dir_all(dst.parent().unwrap_or(Path::new(".")))?;
            copy_file(&src, &dst)
        })
        .await;

        match copied {
            Ok(Ok(())) => {
                log_debug!("evidence preserved {} -> {}", source.display(), target.display());
                Some(target)
            }
            Ok(Err(err)) => {
                log_warn!(
                    "failed to preserve evidence device={} anomaly={} source={}: {err}",
                    root.device_id,
                    kind,
                    source.display()
                );
                None
            }
            Err(err) => {
                log_warn!("evidence copy worker join failed: {err}");
                None
            }
        }
    }
}

fn display_opt(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}
