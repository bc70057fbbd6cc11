use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::audio::{AudioCache, AudioReading};
use crate::incidents::{AnomalyKind, IncidentManager};
use crate::layout::{list_hot_files, parse_sequence, CaptureRoot, Category};
use crate::metrics::{FrameMetrics, FrameOutcome, MetricsCollector};

use super::analysis::{FrameAnalysis, FrameAnalyzer, FrameFingerprint};
use super::is_frame_name;
use super::metadata::MetadataRecord;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_warn};

/// Turns one visible capture frame into a metadata record and incident
/// signals. One handler per device; frames arrive sequentially.
pub struct FrameHandler {
    root: CaptureRoot,
    analyzer: Arc<dyn FrameAnalyzer>,
    audio: Arc<AudioCache>,
    incidents: Arc<IncidentManager>,
    metrics: MetricsCollector,
    last_fingerprint: Option<FrameFingerprint>,
}

#[derive(Default)]
struct Timings {
    analysis_ms: u64,
    audio_ms: u64,
    write_ms: u64,
    incidents_ms: u64,
}

impl FrameHandler {
    pub fn new(
        root: CaptureRoot,
        analyzer: Arc<dyn FrameAnalyzer>,
        audio: Arc<AudioCache>,
        incidents: Arc<IncidentManager>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            root,
            analyzer,
            audio,
            incidents,
            metrics,
            last_fingerprint: None,
        }
    }

    pub fn root(&self) -> &CaptureRoot {
        &self.root
    }

    pub async fn handle_frame(&mut self, frame: &Path) -> Result<FrameOutcome> {
        self.handle_frame_at(frame, Utc::now()).await
    }

    pub async fn handle_frame_at(&mut self, frame: &Path, now: DateTime<Utc>) -> Result<FrameOutcome> {
        let started = Instant::now();
        let mut timings = Timings::default();
        let outcome = self.process(frame, now, &mut timings).await;

        if let Ok(outcome) = &outcome {
            self.metrics
                .record_frame(FrameMetrics {
                    timestamp: now,
                    device_id: self.root.device_id.clone(),
                    outcome: *outcome,
                    analysis_ms: timings.analysis_ms,
                    audio_ms: timings.audio_ms,
                    write_ms: timings.write_ms,
                    incidents_ms: timings.incidents_ms,
                    total_ms: started.elapsed().as_millis() as u64,
                })
                .await;
        }
        outcome
    }

    async fn process(
        &mut self,
        frame: &Path,
        now: DateTime<Utc>,
        timings: &mut Timings,
    ) -> Result<FrameOutcome> {
        let name = frame
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| is_frame_name(n))
            .ok_or_else(|| anyhow!("not a capture frame: {}", frame.display()))?
            .to_string();
        let metadata_path = self
            .root
            .metadata_path_for(frame)
            .ok_or_else(|| anyhow!("no metadata path for {}", frame.display()))?;

        if tokio::fs::try_exists(&metadata_path).await.unwrap_or(false) {
            log_debug!("already analyzed device={} frame={}", self.root.device_id, name);
            return Ok(FrameOutcome::Skipped);
        }
        if !tokio::fs::try_exists(frame).await.unwrap_or(false) {
            log_debug!("frame vanished before analysis device={} frame={}", self.root.device_id, name);
            return Ok(FrameOutcome::Vanished);
        }

        let sequence = parse_sequence(&name);
        let step = Instant::now();
        let analysis = self.analyze(frame).await;
        timings.analysis_ms = step.elapsed().as_millis() as u64;

        let analysis = match analysis {
            Ok(analysis) => analysis,
            Err(err) => {
                if !tokio::fs::try_exists(frame).await.unwrap_or(false) {
                    log_debug!("frame vanished during analysis device={} frame={}", self.root.device_id, name);
                    return Ok(FrameOutcome::Vanished);
                }
                log_warn!("frame analysis failed device={} frame={}: {err:#}", self.root.device_id, name);
                let record = MetadataRecord::failed(&self.root.device_id, &name, sequence, format!("{err:#}"), now);
                self.write_record(record, metadata_path).await?;
                return Ok(FrameOutcome::Failed);
            }
        };

        let step = Instant::now();
        let audio = self.audio.check_at(&self.root, now).await;
        timings.audio_ms = step.elapsed().as_millis() as u64;
        if let Err(err) = &audio {
            log_warn!("audio check failed device={}: {err:#}", self.root.device_id);
        }

        let record = MetadataRecord::analyzed(
            &self.root.device_id,
            &name,
            sequence,
            &analysis,
            self.analyzer.method(),
            audio.as_ref().map_err(|err| format!("{err:#}")),
            now,
        );
        let step = Instant::now();
        self.write_record(record, metadata_path).await?;
        timings.write_ms = step.elapsed().as_millis() as u64;

        let step = Instant::now();
        self.advance_incidents(frame, &analysis, audio.ok().as_ref(), now).await;
        timings.incidents_ms = step.elapsed().as_millis() as u64;

        self.last_fingerprint = Some(analysis.fingerprint);
        Ok(FrameOutcome::Analyzed)
    }

    async fn analyze(&self, frame: &Path) -> Result<FrameAnalysis> {
        let analyzer = Arc::clone(&self.analyzer);
        let previous = self.last_fingerprint.clone();
        let frame = frame.to_path_buf();
        tokio::task::spawn_blocking(move || analyzer.analyze(&frame, previous.as_ref()))
            .await
            .context("frame analysis worker join failed")?
    }

    async fn write_record(&self, record: MetadataRecord, path: PathBuf) -> Result<()> {
        tokio::task::spawn_blocking(move || record.write(&path))
            .await
            .context("metadata writer join failed")?
    }

    /// A missing audio reading leaves the audio-loss state untouched.
    async fn advance_incidents(
        &self,
        frame: &Path,
        analysis: &FrameAnalysis,
        audio: Option<&AudioReading>,
        now: DateTime<Utc>,
    ) {
        let evidence = match self.root.thumbnail_path_for(frame) {
            Some(thumb) if tokio::fs::try_exists(&thumb).await.unwrap_or(false) => thumb,
            _ => frame.to_path_buf(),
        };

        for kind in AnomalyKind::ALL {
            let active = match kind {
                AnomalyKind::Blackscreen => analysis.blackscreen,
                AnomalyKind::Freeze => analysis.freeze,
                AnomalyKind::Macroblocks => analysis.macroblocks,
                AnomalyKind::AudioLoss => match audio {
                    Some(reading) => !reading.present,
                    None => continue,
                },
            };
            if let Err(err) = self
                .incidents
                .observe(&self.root, kind, active, Some(&evidence), now)
                .await
            {
                log_error!(
                    "incident transition failed device={} anomaly={}: {err:#}",
                    self.root.device_id,
                    kind
                );
            }
        }
    }

    /// Process the newest `lookback` frames already in hot storage, oldest
    /// first. Frames with a metadata record are skipped.
    pub async fn catch_up(&mut self, lookback: usize) -> Result<usize> {
        if lookback == 0 {
            return Ok(0);
        }
        let dir = self.root.hot_category_dir(Category::Captures);
        let listed = tokio::task::spawn_blocking(move || list_hot_files(&dir))
            .await
            .context("catch-up listing join failed")?
            .context("failed to list hot captures")?;

        let frames: Vec<_> = listed
            .into_iter()
            .filter(|file| is_frame_name(&file.name))
            .collect();
        let start = frames.len().saturating_sub(lookback);

        let mut analyzed = 0;
        for file in &frames[start..] {
            match self.handle_frame(&file.path).await {
                Ok(FrameOutcome::Analyzed) => analyzed += 1,
                Ok(_) => {}
                Err(err) => log_warn!("catch-up failed frame={}: {err:#}", file.name),
            }
        }
        Ok(analyzed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tests::FakeProbe;
    use crate::audio::FfmpegAudioProbe;
    use crate::db::Database;
    use crate::incidents::IncidentPhase;
    use crate::layout::HourClock;
    use crate::monitor::analysis::LumaFrameAnalyzer;
    use crate::settings::{AnalyzerSettings, ConfirmationDelays, IncidentSettings};
    use crate::upload::{RetryPolicy, UploadQueue};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio_util::sync::CancellationToken;

    struct FakeAnalyzer {
        black: AtomicBool,
        calls: AtomicUsize,
    }

    impl FrameAnalyzer for FakeAnalyzer {
        fn analyze(&self, _frame: &Path, _previous: Option<&FrameFingerprint>) -> Result<FrameAnalysis> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FrameAnalysis {
                blackscreen: self.black.load(Ordering::SeqCst),
                black_ratio: 0.0,
                freeze: false,
                freeze_diff: None,
                macroblocks: false,
                macroblock_score: 1.0,
                fingerprint: FrameFingerprint {
                    width: 1,
                    height: 1,
                    luma: vec![0],
                },
            })
        }

        fn method(&self) -> &'static str {
            "fake"
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: CaptureRoot,
        db: Database,
        incidents: Arc<IncidentManager>,
        probe: Arc<FakeProbe>,
        audio: Arc<AudioCache>,
        metrics: MetricsCollector,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = CaptureRoot::under("dev1", dir.path());
        root.ensure_layout().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();
        let uploads = UploadQueue::new(
            None,
            db.clone(),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            CancellationToken::new(),
        );
        let settings = IncidentSettings {
            confirmation_delay_secs: ConfirmationDelays {
                blackscreen: 0,
                freeze: 10,
                macroblocks: 10,
                audio_loss: 10,
            },
        };
        let incidents = Arc::new(IncidentManager::new(db.clone(), uploads, settings, HourClock::utc()));
        let probe = Arc::new(FakeProbe::new(-20.0));
        let audio = Arc::new(AudioCache::new(probe.clone(), Duration::from_secs(30), -50.0));
        Fixture {
            _dir: dir,
            root,
            db,
            incidents,
            probe,
            audio,
            metrics: MetricsCollector::new(0),
        }
    }

    fn fake_handler(f: &Fixture, analyzer: Arc<FakeAnalyzer>) -> FrameHandler {
        FrameHandler::new(f.root.clone(), analyzer, f.audio.clone(), f.incidents.clone(), f.metrics.clone())
    }

    fn fake_analyzer(black: bool) -> Arc<FakeAnalyzer> {
        Arc::new(FakeAnalyzer {
            black: AtomicBool::new(black),
            calls: AtomicUsize::new(0),
        })
    }

    fn frame_path(root: &CaptureRoot, seq: u32) -> PathBuf {
        root.hot_category_dir(Category::Captures)
            .join(format!("capture_{seq:06}.jpg"))
    }

    fn frame(root: &CaptureRoot, seq: u32) -> PathBuf {
        let path = frame_path(root, seq);
        std::fs::write(&path, b"jpg").unwrap();
        path
    }

    #[tokio::test]
    async fn handling_twice_writes_one_record_and_one_transition() {
        let f = fixture();
        let analyzer = fake_analyzer(true);
        let mut handler = fake_handler(&f, analyzer.clone());
        let path = frame(&f.root, 1);

        let first = handler.handle_frame(&path).await.unwrap();
        let second = handler.handle_frame(&path).await.unwrap();

        assert_eq!(first, FrameOutcome::Analyzed);
        assert_eq!(second, FrameOutcome::Skipped);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);

        let record = MetadataRecord::read(&f.root.metadata_path_for(&path).unwrap()).unwrap();
        assert_eq!(record.blackscreen, Some(true));
        assert_eq!(record.sequence, Some(1));
        assert_eq!(record.audio, Some(true));
        assert!(record.error.is_none());

        assert_eq!(f.db.list_incidents(None, false).await.unwrap().len(), 1);
        assert_eq!(
            f.incidents.phase("dev1", AnomalyKind::Blackscreen).await,
            IncidentPhase::Confirmed
        );
    }

    #[tokio::test]
    async fn undecodable_frame_gets_error_marker_and_no_transition() {
        let f = fixture();
        let analyzer = Arc::new(LumaFrameAnalyzer::new(AnalyzerSettings::default()));
        let mut handler = FrameHandler::new(f.root.clone(), analyzer, f.audio.clone(), f.incidents.clone(), f.metrics.clone());
        let path = frame(&f.root, 2);

        let outcome = handler.handle_frame(&path).await.unwrap();

        assert_eq!(outcome, FrameOutcome::Failed);
        let record = MetadataRecord::read(&f.root.metadata_path_for(&path).unwrap()).unwrap();
        assert!(record.error.is_some());
        assert!(record.blackscreen.is_none());
        for kind in AnomalyKind::ALL {
            assert_eq!(f.incidents.phase("dev1", kind).await, IncidentPhase::None);
        }
        assert_eq!(
            handler.handle_frame(&path).await.unwrap(),
            FrameOutcome::Skipped,
            "failed frames are not retried"
        );
    }

    #[tokio::test]
    async fn vanished_frame_leaves_no_marker() {
        let f = fixture();
        let mut handler = fake_handler(&f, fake_analyzer(false));
        let path = f.root.hot_category_dir(Category::Captures).join("capture_000009.jpg");

        assert_eq!(handler.handle_frame(&path).await.unwrap(), FrameOutcome::Vanished);
        assert!(!f.root.metadata_path_for(&path).unwrap().exists());
    }

    #[tokio::test]
    async fn catch_up_processes_only_the_newest_frames() {
        let f = fixture();
        let analyzer = fake_analyzer(false);
        let mut handler = fake_handler(&f, analyzer.clone());
        for seq in 1..=15 {
            frame(&f.root, seq);
        }
        let already = f.root.hot_category_dir(Category::Captures).join("capture_000015.jpg");
        handler.handle_frame(&already).await.unwrap();

        let analyzed = handler.catch_up(10).await.unwrap();

        assert_eq!(analyzed, 9);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 10);
        let oldest = f.root.hot_category_dir(Category::Captures).join("capture_000005.jpg");
        assert!(!f.root.metadata_path_for(&oldest).unwrap().exists());
    }

    #[tokio::test]
    async fn audio_loss_confirms_after_cached_volume_expires() {
        let f = fixture();
        let mut handler = fake_handler(&f, fake_analyzer(false));
        let t0 = Utc::now();

        for secs in 0..=60u32 {
            if secs == 25 {
                f.probe.presence.store(false, Ordering::SeqCst);
                f.probe.precise_fails.store(true, Ordering::SeqCst);
            }
            let path = frame(&f.root, secs + 1);
            let at = t0 + chrono::Duration::seconds(secs.into());
            assert_eq!(handler.handle_frame_at(&path, at).await.unwrap(), FrameOutcome::Analyzed);
        }

        assert_eq!(
            f.incidents.phase("dev1", AnomalyKind::AudioLoss).await,
            IncidentPhase::Confirmed
        );
        let incidents = f.db.list_incidents(None, false).await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].started_at, t0 + chrono::Duration::seconds(25));
    }

    #[tokio::test]
    async fn device_without_audio_confirms_audio_loss() {
        let f = fixture();
        let audio = Arc::new(AudioCache::new(
            Arc::new(FfmpegAudioProbe::new(Duration::from_secs(1))),
            Duration::from_secs(30),
            -50.0,
        ));
        let mut handler = FrameHandler::new(
            f.root.clone(),
            fake_analyzer(false),
            audio,
            f.incidents.clone(),
            f.metrics.clone(),
        );
        let t0 = Utc::now();

        for secs in 0..=15u32 {
            let path = frame(&f.root, secs + 1);
            handler
                .handle_frame_at(&path, t0 + chrono::Duration::seconds(secs.into()))
                .await
                .unwrap();
        }

        let record = MetadataRecord::read(
            &f.root.metadata_path_for(&frame_path(&f.root, 1)).unwrap(),
        )
        .unwrap();
        assert_eq!(record.audio, Some(false));
        assert!(record.audio_error.is_none());
        assert_eq!(
            f.incidents.phase("dev1", AnomalyKind::AudioLoss).await,
            IncidentPhase::Confirmed
        );
    }
}
