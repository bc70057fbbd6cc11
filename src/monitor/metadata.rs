use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audio::{AudioMethod, AudioReading};
use crate::layout::write_atomic;

use super::analysis::FrameAnalysis;

/// Per-frame analysis result. Its existence marks the frame as handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub frame: String,
    pub device_id: String,
    pub sequence: Option<u64>,
    pub analyzed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blackscreen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub black_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_diff: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macroblocks: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macroblock_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_db: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_method: Option<AudioMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_method: Option<String>,
    pub error: Option<String>,
}

impl MetadataRecord {
    fn identity(device_id: &str, frame: &str, sequence: Option<u64>, now: DateTime<Utc>) -> Self {
        Self {
            frame: frame.to_string(),
            device_id: device_id.to_string(),
            sequence,
            analyzed_at: now,
            blackscreen: None,
            black_ratio: None,
            freeze: None,
            freeze_diff: None,
            macroblocks: None,
            macroblock_score: None,
            audio: None,
            volume_db: None,
            volume_percent: None,
            audio_method: None,
            audio_error: None,
            analysis_method: None,
            error: None,
        }
    }

    pub fn analyzed(
        device_id: &str,
        frame: &str,
        sequence: Option<u64>,
        analysis: &FrameAnalysis,
        method: &str,
        audio: Result<&AudioReading, String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::identity(device_id, frame, sequence, now);
        record.blackscreen = Some(analysis.blackscreen);
        record.black_ratio = Some(analysis.black_ratio);
        record.freeze = Some(analysis.freeze);
        record.freeze_diff = analysis.freeze_diff;
        record.macroblocks = Some(analysis.macroblocks);
        record.macroblock_score = Some(analysis.macroblock_score);
        record.analysis_method = Some(method.to_string());
        match audio {
            Ok(reading) => {
                record.audio = Some(reading.present);
                record.volume_db = reading.volume_db;
                record.volume_percent = reading.volume_percent;
                record.audio_method = Some(reading.method);
            }
            Err(message) => record.audio_error = Some(message),
        }
        record
    }

    pub fn failed(
        device_id: &str,
        frame: &str,
        sequence: Option<u64>,
        error: String,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::identity(device_id, frame, sequence, now);
        record.error = Some(error);
        record
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("failed to encode metadata record")?;
        write_atomic(path, &bytes)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read metadata {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("malformed metadata {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::analysis::FrameFingerprint;

    #[test]
    fn failed_record_carries_only_identity_and_error() {
        let record = MetadataRecord::failed("dev1", "capture_7.jpg", Some(7), "decode".into(), Utc::now());
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["frame"], "capture_7.jpg");
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["error"], "decode");
        assert!(json.get("blackscreen").is_none());
        assert!(json.get("audio").is_none());
    }

    #[test]
    fn audio_method_uses_wire_names() {
        let reading = AudioReading {
            present: true,
            volume_db: Some(-23.0),
            volume_percent: Some(62),
            method: AudioMethod::PresenceCachedVolume,
        };
        let analysis = FrameAnalysis {
            blackscreen: false,
            black_ratio: 0.0,
            freeze: false,
            freeze_diff: None,
            macroblocks: false,
            macroblock_score: 1.0,
            fingerprint: FrameFingerprint {
                width: 0,
                height: 0,
                luma: Vec::new(),
            },
        };
        let record = MetadataRecord::analyzed("dev1", "capture_1.jpg", Some(1), &analysis, "image-luma", Ok(&reading), Utc::now());
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["audio_method"], "presence+cached-volume");
        assert_eq!(json["analysis_method"], "image-luma");
        assert!(json["error"].is_null());
    }
}
