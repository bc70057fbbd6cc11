use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOutcome {
    Analyzed,
    Skipped,
    Vanished,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub outcome: FrameOutcome,
    pub analysis_ms: u64,
    pub audio_ms: u64,
    pub write_ms: u64,
    pub incidents_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub recent_frames: Vec<FrameMetrics>,
    pub frame_count: u64,
    pub analyzed_count: u64,
    pub skipped_count: u64,
    pub failed_count: u64,
    pub avg_total_ms: f64,
}
