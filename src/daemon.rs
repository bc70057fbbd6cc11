use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archiver::{archiver_loop, TieringArchiver};
use crate::audio::{AudioCache, FfmpegAudioProbe};
use crate::db::Database;
use crate::incidents::IncidentManager;
use crate::layout::CaptureRoot;
use crate::metrics::MetricsCollector;
use crate::monitor::{FrameAnalyzer, FrameHandler, LumaFrameAnalyzer, MonitorController};
use crate::settings::Settings;
use crate::upload::{upload_sweep_loop, DirectorySink, RetryPolicy, UploadQueue, UploadSink};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const UPLOAD_SHUTDOWN_GRACE_SECS: u64 = 15;

/// Everything the long-running process owns. Built once at startup and torn
/// down in reverse on shutdown.
pub struct Daemon {
    db: Database,
    uploads: UploadQueue,
    metrics: MetricsCollector,
    monitors: MonitorController,
    archiver: Option<JoinHandle<()>>,
    upload_sweep: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl Daemon {
    pub async fn start(settings: Settings) -> Result<Self> {
        let roots = settings.capture_roots()?;
        if roots.is_empty() {
            log_warn!("no devices configured; only the database will be opened");
        }
        for root in &roots {
            if let Err(err) = ensure_layout_blocking(root.clone()).await {
                log_warn!("layout for device {} incomplete: {err:#}", root.device_id);
            }
        }

        let db = Database::new(settings.database_path.clone())?;
        let cancel_token = CancellationToken::new();

        let sink: Option<Arc<dyn UploadSink>> = settings
            .upload
            .sink_dir
            .clone()
            .map(|dir| Arc::new(DirectorySink::new(dir)) as Arc<dyn UploadSink>);
        if sink.is_none() {
            log_info!("no upload sink configured; evidence stays in cold storage");
        }
        let uploads = UploadQueue::new(
            sink,
            db.clone(),
            RetryPolicy::from_settings(&settings.upload),
            CancellationToken::new(),
        );

        let clock = settings.hour_clock();
        let incidents = Arc::new(IncidentManager::new(
            db.clone(),
            uploads.clone(),
            settings.incidents.clone(),
            clock,
        ));
        let restored = incidents.restore_open().await?;
        if restored > 0 {
            log_info!("restored {} open incidents", restored);
        }
        if let Err(err) = uploads.requeue_pending().await {
            log_warn!("startup upload sweep failed: {err:#}");
        }
        let upload_sweep = tokio::spawn(upload_sweep_loop(
            uploads.clone(),
            settings.upload.sweep_interval(),
            cancel_token.clone(),
        ));

        let audio = Arc::new(AudioCache::new(
            Arc::new(FfmpegAudioProbe::new(Duration::from_secs(settings.audio.probe_timeout_secs))),
            settings.precise_interval(),
            settings.audio.silence_threshold_db,
        ));
        let analyzer: Arc<dyn FrameAnalyzer> =
            Arc::new(LumaFrameAnalyzer::new(settings.monitor.analyzer.clone()));
        let metrics = MetricsCollector::new(settings.monitor.metrics_log_every);

        let archiver = TieringArchiver::new(
            roots.clone(),
            settings.hot_limits.clone(),
            settings.archiver.clone(),
            clock,
        );
        let archiver = tokio::spawn(archiver_loop(
            archiver,
            settings.archiver.interval(),
            cancel_token.clone(),
        ));

        let handlers = roots
            .into_iter()
            .map(|root| {
                FrameHandler::new(
                    root,
                    Arc::clone(&analyzer),
                    Arc::clone(&audio),
                    Arc::clone(&incidents),
                    metrics.clone(),
                )
            })
            .collect();
        let mut monitors = MonitorController::new();
        let watching = monitors.start(
            handlers,
            settings.monitor.catch_up_frames,
            settings.monitor.channel_capacity,
        )?;

        log_info!(
            "capkeep running devices={} monitored={} db={}",
            settings.devices.len(),
            watching,
            db.path().display()
        );

        Ok(Self {
            db,
            uploads,
            metrics,
            monitors,
            archiver: Some(archiver),
            upload_sweep: Some(upload_sweep),
            cancel_token,
        })
    }

    pub async fn shutdown(mut self) -> Result<()> {
        log_info!("shutting down");
        self.cancel_token.cancel();

        // Join failures are logged and shutdown continues.
        if let Err(err) = self.monitors.stop().await {
            log_error!("monitor shutdown incomplete: {err:#}");
        }
        for (name, handle) in [("archiver", self.archiver.take()), ("upload sweep", self.upload_sweep.take())] {
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    log_error!("{name} task failed to join: {err}");
                }
            }
        }
        self.uploads
            .shutdown(Duration::from_secs(UPLOAD_SHUTDOWN_GRACE_SECS))
            .await;

        let snapshot = self.metrics.get_snapshot().await;
        log_info!(
            "stopped frames={} analyzed={} failed={} db={}",
            snapshot.frame_count,
            snapshot.analyzed_count,
            snapshot.failed_count,
            self.db.path().display()
        );
        Ok(())
    }
}

async fn ensure_layout_blocking(root: CaptureRoot) -> Result<()> {
    tokio::task::spawn_blocking(move || root.ensure_layout())
        .await
        .context("layout worker join failed")?
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log_warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                log_warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

pub async fn run_daemon(settings: Settings) -> Result<()> {
    let daemon = Daemon::start(settings).await?;
    shutdown_signal().await;
    daemon.shutdown().await
}
