mod types;

pub use types::{FrameMetrics, FrameOutcome, MetricsSnapshot, SystemMetrics};

use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

const ENABLE_LOGS: bool = true;

use crate::log_info;

const MAX_RECENT_FRAMES: usize = 20;

/// Frame timings shared by every device worker, plus this process's CPU and
/// memory from sysinfo.
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
    log_every: u64,
}

struct MetricsState {
    recent_frames: Vec<FrameMetrics>,
    frame_count: u64,
    analyzed_count: u64,
    skipped_count: u64,
    failed_count: u64,
    system: System,
    pid: Pid,
}

impl MetricsCollector {
    /// `log_every` of 0 disables the periodic snapshot log.
    pub fn new(log_every: u64) -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // CPU usage is a delta, so take the baseline now
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_frames: Vec::with_capacity(MAX_RECENT_FRAMES),
                frame_count: 0,
                analyzed_count: 0,
                skipped_count: 0,
                failed_count: 0,
                system,
                pid,
            })),
            log_every,
        }
    }

    pub async fn record_frame(&self, metrics: FrameMetrics) {
        let should_log = {
            let mut state = self.inner.lock().await;

            state.frame_count += 1;
            match metrics.outcome {
                FrameOutcome::Analyzed => state.analyzed_count += 1,
                FrameOutcome::Failed => state.failed_count += 1,
                FrameOutcome::Skipped | FrameOutcome::Vanished => state.skipped_count += 1,
            }

            state.recent_frames.push(metrics);
            if state.recent_frames.len() > MAX_RECENT_FRAMES {
                state.recent_frames.remove(0);
            }

            self.log_every > 0 && state.frame_count % self.log_every == 0
        };

        if should_log {
            let snapshot = self.get_snapshot().await;
            log_info!(
                "frames={} analyzed={} skipped={} failed={} avg_ms={:.1} cpu={:.1}% mem={:.1}MB",
                snapshot.frame_count,
                snapshot.analyzed_count,
                snapshot.skipped_count,
                snapshot.failed_count,
                snapshot.avg_total_ms,
                snapshot.system.cpu_percent,
                snapshot.system.memory_mb
            );
        }
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let pid = state.pid;

        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system_metrics = state
            .system
            .process(pid)
            .map(|process| SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            })
            .unwrap_or_default();

        let avg_total_ms = if state.recent_frames.is_empty() {
            0.0
        } else {
            state.recent_frames.iter().map(|m| m.total_ms as f64).sum::<f64>()
                / state.recent_frames.len() as f64
        };

        MetricsSnapshot {
            system: system_metrics,
            recent_frames: state.recent_frames.clone(),
            frame_count: state.frame_count,
            analyzed_count: state.analyzed_count,
            skipped_count: state.skipped_count,
            failed_count: state.failed_count,
            avg_total_ms,
        }
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            log_every: self.log_every,
        }
    }
}
