//! Boundary to durable remote storage for incident evidence.
//!
//! Uploads run on tracked background tasks with retry and backoff. The local
//! cold copy is never touched here, so evidence survives until the upload
//! lands (or until the 24h bucket rotation replaces it). Evidence whose
//! retries ran out is picked up again by `requeue_pending`, at startup and on
//! every sweep.

mod retry;

pub use retry::RetryPolicy;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;

use crate::db::{Database, Incident};
use crate::layout::copy_file;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[async_trait]
pub trait UploadSink: Send + Sync {
    /// Store `local_path` durably and return a reference to the remote copy.
    async fn upload(&self, device_id: &str, local_path: &Path) -> Result<String>;
}

/// Sink backed by a (typically network-mounted) directory.
pub struct DirectorySink {
    dest: PathBuf,
}

impl DirectorySink {
    pub fn new(dest: PathBuf) -> Self {
        Self { dest }
    }
}

#[async_trait]
impl UploadSink for DirectorySink {
    async fn upload(&self, device_id: &str, local_path: &Path) -> Result<String> {
        let name = local_path
            .file_name()
            .ok_or_else(|| anyhow!("upload source {} has no file name", local_path.display()))?;
        let dir = self
            .dest
            .join(device_id)
            .join(Utc::now().format("%Y%m%d").to_string());
        let target = dir.join(name);
        let source = local_path.to_path_buf();
        let target_for_copy = target.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            copy_file(&source, &target_for_copy)
                .with_context(|| format!("failed to copy {}", source.display()))?;
            Ok(())
        })
        .await
        .context("upload copy worker join failed")??;

        Ok(format!("file://{}", target.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvidenceSlot {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub struct UploadJob {
    pub incident_id: String,
    pub device_id: String,
    pub local_path: PathBuf,
    pub slot: EvidenceSlot,
}

impl UploadJob {
    /// Jobs for every evidence slot of `incident` still missing a remote ref.
    pub fn pending_for(incident: &Incident) -> Vec<UploadJob> {
        let start = incident
            .start_evidence_path
            .as_ref()
            .filter(|_| incident.start_evidence_ref.is_none())
            .map(|path| (path, EvidenceSlot::Start));
        let end = incident
            .end_evidence_path
            .as_ref()
            .filter(|_| incident.end_evidence_ref.is_none())
            .map(|path| (path, EvidenceSlot::End));

        start
            .into_iter()
            .chain(end)
            .map(|(path, slot)| UploadJob {
                incident_id: incident.id.clone(),
                device_id: incident.device_id.clone(),
                local_path: path.clone(),
                slot,
            })
            .collect()
    }
}

type InFlight = Arc<Mutex<HashSet<(String, EvidenceSlot)>>>;

#[derive(Clone)]
pub struct UploadQueue {
    sink: Option<Arc<dyn UploadSink>>,
    db: Database,
    policy: RetryPolicy,
    tracker: TaskTracker,
    in_flight: InFlight,
    cancel_token: CancellationToken,
}

impl UploadQueue {
    pub fn new(
        sink: Option<Arc<dyn UploadSink>>,
        db: Database,
        policy: RetryPolicy,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            sink,
            db,
            policy,
            tracker: TaskTracker::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancel_token,
        }
    }

    /// Start uploading in the background. Never blocks the caller on the sink.
    /// Returns false when uploads are disabled or the same evidence is already
    /// being uploaded.
    pub fn enqueue(&self, job: UploadJob) -> bool {
        let Some(sink) = self.sink.clone() else {
            log_debug!(
                "upload disabled; evidence kept locally incident={} path={}",
                job.incident_id,
                job.local_path.display()
            );
            return false;
        };

        let key = (job.incident_id.clone(), job.slot);
        let fresh = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone());
        if !fresh {
            log_debug!("upload already in flight incident={} slot={:?}", key.0, key.1);
            return false;
        }

        let db = self.db.clone();
        let policy = self.policy.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let cancel_token = self.cancel_token.clone();
        self.tracker.spawn(async move {
            run_upload(sink, db, policy, cancel_token, job).await;
            in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&key);
        });
        true
    }

    /// Enqueue every recorded evidence file that never reached the sink.
    pub async fn requeue_pending(&self) -> Result<usize> {
        if self.sink.is_none() {
            return Ok(0);
        }
        let pending = self
            .db
            .list_pending_uploads()
            .await
            .context("failed to list pending uploads")?;

        let mut started = 0;
        for incident in &pending {
            for job in UploadJob::pending_for(incident) {
                if self.enqueue(job) {
                    started += 1;
                }
            }
        }
        if started > 0 {
            log_info!("re-queued {} pending evidence uploads", started);
        }
        Ok(started)
    }

    /// Wait for every upload started so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Wait up to `grace` for in-flight uploads; the rest are abandoned and
    /// their evidence stays in cold storage.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            log_warn!(
                "abandoning {} in-flight uploads after {}s",
                self.tracker.len(),
                grace.as_secs()
            );
            self.cancel_token.cancel();
        }
    }
}

async fn run_upload(
    sink: Arc<dyn UploadSink>,
    db: Database,
    policy: RetryPolicy,
    cancel_token: CancellationToken,
    job: UploadJob,
) {
    let mut attempt: u32 = 1;
    loop {
        match sink.upload(&job.device_id, &job.local_path).await {
            Ok(remote_ref) => {
                let recorded = match job.slot {
                    EvidenceSlot::Start => db.mark_start_uploaded(&job.incident_id, &remote_ref).await,
                    EvidenceSlot::End => db.mark_end_uploaded(&job.incident_id, &remote_ref).await,
                };
                match recorded {
                    Ok(()) => log_info!(
                        "evidence uploaded incident={} device={} slot={:?} attempt={} ref={}",
                        job.incident_id,
                        job.device_id,
                        job.slot,
                        attempt,
                        remote_ref
                    ),
                    Err(err) => log_error!(
                        "evidence uploaded but not recorded incident={} ref={}: {err:?}",
                        job.incident_id,
                        remote_ref
                    ),
                }
                return;
            }
            Err(err) if attempt >= policy.max_attempts => {
                log_error!(
                    "upload deferred to next sweep incident={} device={} attempts={} path={}: {err:?}",
                    job.incident_id,
                    job.device_id,
                    attempt,
                    job.local_path.display()
                );
                return;
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                log_warn!(
                    "upload failed incident={} attempt={} retry_in_ms={}: {err}",
                    job.incident_id,
                    attempt,
                    delay.as_millis()
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel_token.cancelled() => {
                        log_warn!(
                            "upload cancelled incident={} path={}",
                            job.incident_id,
                            job.local_path.display()
                        );
                        return;
                    }
                }
                attempt += 1;
            }
        }
    }
}

/// Re-queue pending evidence every `interval` until cancelled.
pub async fn upload_sweep_loop(
    uploads: UploadQueue,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately; startup already swept
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = uploads.requeue_pending().await {
                    log_warn!("upload sweep failed: {err:#}");
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("upload sweep shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::incidents::AnomalyKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Records what it was asked to upload and whether the file existed then.
    pub(crate) struct RecordingSink {
        pub failures_before_success: AtomicUsize,
        pub calls: AtomicUsize,
        pub uploaded: Mutex<Vec<(PathBuf, bool)>>,
    }

    impl RecordingSink {
        pub(crate) fn new(failures_before_success: usize) -> Self {
            Self {
                failures_before_success: AtomicUsize::new(failures_before_success),
                calls: AtomicUsize::new(0),
                uploaded: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UploadSink for RecordingSink {
        async fn upload(&self, _device_id: &str, local_path: &Path) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(anyhow!("sink unavailable"));
            }
            self.uploaded
                .lock()
                .unwrap()
                .push((local_path.to_path_buf(), local_path.exists()));
            Ok(format!("remote://{}", local_path.display()))
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn retries_until_sink_accepts() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();
        let evidence = dir.path().join("freeze_start_capture_1_thumbnail.jpg");
        std::fs::write(&evidence, b"jpg").unwrap();

        let now = Utc::now();
        let incident = Incident::confirmed("dev1", AnomalyKind::Freeze, now, Some(evidence.clone()), now);
        db.insert_incident(&incident).await.unwrap();

        let sink = Arc::new(RecordingSink::new(2));
        let queue = UploadQueue::new(Some(sink.clone()), db.clone(), fast_policy(5), CancellationToken::new());
        queue.enqueue(UploadJob {
            incident_id: incident.id.clone(),
            device_id: "dev1".into(),
            local_path: evidence.clone(),
            slot: EvidenceSlot::Start,
        });
        queue.flush().await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        let stored = db.get_incident(&incident.id).await.unwrap().unwrap();
        assert!(stored.uploaded);
        assert!(evidence.exists(), "local copy is kept after upload");
    }

    #[tokio::test]
    async fn stops_after_max_attempts_and_keeps_local_copy() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();
        let evidence = dir.path().join("e.jpg");
        std::fs::write(&evidence, b"jpg").unwrap();

        let now = Utc::now();
        let incident = Incident::confirmed("dev1", AnomalyKind::Blackscreen, now, Some(evidence.clone()), now);
        db.insert_incident(&incident).await.unwrap();

        let sink = Arc::new(RecordingSink::new(100));
        let queue = UploadQueue::new(Some(sink.clone()), db.clone(), fast_policy(3), CancellationToken::new());
        queue.enqueue(UploadJob {
            incident_id: incident.id.clone(),
            device_id: "dev1".into(),
            local_path: evidence.clone(),
            slot: EvidenceSlot::Start,
        });
        queue.flush().await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert!(!db.get_incident(&incident.id).await.unwrap().unwrap().uploaded);
        assert!(evidence.exists());
    }

    #[tokio::test]
    async fn directory_sink_copies_under_device_and_day() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("capture_3_thumbnail.jpg");
        std::fs::write(&source, b"jpg").unwrap();

        let sink = DirectorySink::new(dir.path().join("remote"));
        let reference = sink.upload("dev1", &source).await.unwrap();

        let day = Utc::now().format("%Y%m%d").to_string();
        let expected = dir.path().join("remote").join("dev1").join(day).join("capture_3_thumbnail.jpg");
        assert!(expected.exists());
        assert_eq!(reference, format!("file://{}", expected.display()));
    }

    #[tokio::test]
    async fn restarted_queue_uploads_evidence_left_pending() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();
        let evidence = dir.path().join("macroblocks_start_capture_4_thumbnail.jpg");
        std::fs::write(&evidence, b"jpg").unwrap();

        let now = Utc::now();
        let incident = Incident::confirmed("dev1", AnomalyKind::Macroblocks, now, Some(evidence.clone()), now);
        db.insert_incident(&incident).await.unwrap();

        let outage = Arc::new(RecordingSink::new(100));
        let first = UploadQueue::new(Some(outage.clone()), db.clone(), fast_policy(2), CancellationToken::new());
        assert!(first.enqueue(UploadJob {
            incident_id: incident.id.clone(),
            device_id: "dev1".into(),
            local_path: evidence.clone(),
            slot: EvidenceSlot::Start,
        }));
        first.flush().await;
        assert!(!db.get_incident(&incident.id).await.unwrap().unwrap().uploaded);

        let sink = Arc::new(RecordingSink::new(0));
        let restarted = UploadQueue::new(Some(sink.clone()), db.clone(), fast_policy(2), CancellationToken::new());
        assert_eq!(restarted.requeue_pending().await.unwrap(), 1);
        restarted.flush().await;

        let stored = db.get_incident(&incident.id).await.unwrap().unwrap();
        assert!(stored.uploaded);
        assert_eq!(sink.uploaded.lock().unwrap()[0].0, evidence);
        assert_eq!(restarted.requeue_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn evidence_in_flight_is_not_queued_twice() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();
        let sink = Arc::new(RecordingSink::new(0));
        let queue = UploadQueue::new(Some(sink.clone()), db, fast_policy(1), CancellationToken::new());
        let job = UploadJob {
            incident_id: "i1".into(),
            device_id: "dev1".into(),
            local_path: dir.path().join("e.jpg"),
            slot: EvidenceSlot::End,
        };

        assert!(queue.enqueue(job.clone()));
        assert!(!queue.enqueue(job.clone()));
        queue.flush().await;
        assert!(queue.enqueue(job));
        queue.flush().await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}
