//! Two-tier audio reading per device.
//!
//! The expensive precise measurement (decode + volume) runs at most once per
//! `precise_interval`; in between only the cheap presence probe runs and the
//! cached volume is reused.

pub mod probe;

pub use probe::{AudioProbe, FfmpegAudioProbe};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::layout::CaptureRoot;

const ENABLE_LOGS: bool = true;

use crate::log_debug;

/// dB value mapped to 0%.
const VOLUME_FLOOR_DB: f64 = -60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioMethod {
    #[serde(rename = "precise")]
    Precise,
    #[serde(rename = "presence+cached-volume")]
    PresenceCachedVolume,
    #[serde(rename = "presence")]
    Presence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioReading {
    pub present: bool,
    pub volume_db: Option<f64>,
    pub volume_percent: Option<u8>,
    pub method: AudioMethod,
}

impl AudioReading {
    fn no_audio(method: AudioMethod) -> Self {
        Self {
            present: false,
            volume_db: None,
            volume_percent: None,
            method,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioCacheEntry {
    pub last_presence_check: Option<DateTime<Utc>>,
    pub last_precise_check: DateTime<Utc>,
    pub volume_db: f64,
    pub volume_percent: u8,
    pub method: AudioMethod,
}

pub fn volume_percent(db: f64) -> u8 {
    if !db.is_finite() {
        return 0;
    }
    let pct = (db - VOLUME_FLOOR_DB) / -VOLUME_FLOOR_DB * 100.0;
    pct.clamp(0.0, 100.0).round() as u8
}

pub struct AudioCache {
    probe: Arc<dyn AudioProbe>,
    entries: Mutex<HashMap<String, AudioCacheEntry>>,
    precise_interval: Duration,
    silence_threshold_db: f64,
}

impl AudioCache {
    pub fn new(
        probe: Arc<dyn AudioProbe>,
        precise_interval: Duration,
        silence_threshold_db: f64,
    ) -> Self {
        Self {
            probe,
            entries: Mutex::new(HashMap::new()),
            precise_interval,
            silence_threshold_db,
        }
    }

    /// The lock is never held across a probe call, so a slow measurement on
    /// one device does not stall the others.
    pub async fn check_at(&self, root: &CaptureRoot, now: DateTime<Utc>) -> Result<AudioReading> {
        let cached = self.entries.lock().await.get(&root.device_id).cloned();

        let fresh = cached.filter(|entry| {
            let age = now
                .signed_duration_since(entry.last_precise_check)
                .to_std()
                .unwrap_or(Duration::ZERO);
            age < self.precise_interval
        });

        let Some(entry) = fresh else {
            return self.measure_precise(root, now).await;
        };

        let stream_alive = self
            .probe
            .probe_presence(root)
            .await
            .with_context(|| format!("audio presence probe failed for {}", root.device_id))?;

        if let Some(stored) = self.entries.lock().await.get_mut(&root.device_id) {
            stored.last_presence_check = Some(now);
            stored.method = if stream_alive {
                AudioMethod::PresenceCachedVolume
            } else {
                AudioMethod::Presence
            };
        }

        if !stream_alive {
            log_debug!("audio presence=false device={}", root.device_id);
            return Ok(AudioReading::no_audio(AudioMethod::Presence));
        }

        Ok(AudioReading {
            present: entry.volume_db > self.silence_threshold_db,
            volume_db: Some(entry.volume_db),
            volume_percent: Some(entry.volume_percent),
            method: AudioMethod::PresenceCachedVolume,
        })
    }

    /// A device without an audio stream reads as silent, whether the precise
    /// measurement says so directly or fails and the presence probe confirms it.
    async fn measure_precise(&self, root: &CaptureRoot, now: DateTime<Utc>) -> Result<AudioReading> {
        let measured = match self.probe.measure_volume(root).await {
            Ok(measured) => measured,
            Err(err) => {
                let stream_alive = self
                    .probe
                    .probe_presence(root)
                    .await
                    .with_context(|| format!("audio presence probe failed for {}", root.device_id))?;
                if stream_alive {
                    return Err(err.context(format!(
                        "precise audio measurement failed for {}",
                        root.device_id
                    )));
                }
                log_debug!("precise audio failed on a dead stream device={}: {err:#}", root.device_id);
                self.entries.lock().await.remove(&root.device_id);
                return Ok(AudioReading::no_audio(AudioMethod::Presence));
            }
        };

        let Some(volume_db) = measured else {
            log_debug!("audio stream absent device={}", root.device_id);
            self.entries.lock().await.remove(&root.device_id);
            return Ok(AudioReading::no_audio(AudioMethod::Precise));
        };
        let percent = volume_percent(volume_db);

        log_debug!(
            "audio precise device={} volume_db={:.1} volume_percent={}",
            root.device_id,
            volume_db,
            percent
        );

        self.entries.lock().await.insert(
            root.device_id.clone(),
            AudioCacheEntry {
                last_presence_check: None,
                last_precise_check: now,
                volume_db,
                volume_percent: percent,
                method: AudioMethod::Precise,
            },
        );

        Ok(AudioReading {
            present: volume_db > self.silence_threshold_db,
            volume_db: Some(volume_db),
            volume_percent: Some(percent),
            method: AudioMethod::Precise,
        })
    }

    pub async fn entry(&self, device_id: &str) -> Option<AudioCacheEntry> {
        self.entries.lock().await.get(device_id).cloned()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// `presence = false` means the stream is gone; `precise_fails` makes
    /// the decode step error like volumedetect on a file without audio.
    pub(crate) struct FakeProbe {
        pub presence: AtomicBool,
        pub precise_fails: AtomicBool,
        pub volume_db: std::sync::Mutex<f64>,
        pub presence_calls: AtomicUsize,
        pub precise_calls: AtomicUsize,
    }

    impl FakeProbe {
        pub(crate) fn new(volume_db: f64) -> Self {
            Self {
                presence: AtomicBool::new(true),
                precise_fails: AtomicBool::new(false),
                volume_db: std::sync::Mutex::new(volume_db),
                presence_calls: AtomicUsize::new(0),
                precise_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AudioProbe for FakeProbe {
        async fn probe_presence(&self, _root: &CaptureRoot) -> Result<bool> {
            self.presence_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.presence.load(Ordering::SeqCst))
        }

        async fn measure_volume(&self, _root: &CaptureRoot) -> Result<Option<f64>> {
            self.precise_calls.fetch_add(1, Ordering::SeqCst);
            if self.precise_fails.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("volumedetect failed"));
            }
            if !self.presence.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(*self.volume_db.lock().unwrap()))
        }
    }

    fn root() -> CaptureRoot {
        CaptureRoot::new("dev1", PathBuf::from("/h"), PathBuf::from("/c"))
    }

    fn cache(probe: Arc<FakeProbe>) -> AudioCache {
        AudioCache::new(probe, Duration::from_secs(30), -50.0)
    }

    #[test]
    fn percent_normalization() {
        assert_eq!(volume_percent(0.0), 100);
        assert_eq!(volume_percent(-30.0), 50);
        assert_eq!(volume_percent(-91.0), 0);
        assert_eq!(volume_percent(6.0), 100);
    }

    #[tokio::test]
    async fn first_check_is_precise() {
        let probe = Arc::new(FakeProbe::new(-20.0));
        let cache = cache(probe.clone());

        let reading = cache.check_at(&root(), Utc::now()).await.unwrap();

        assert_eq!(reading.method, AudioMethod::Precise);
        assert!(reading.present);
        assert_eq!(reading.volume_db, Some(-20.0));
        assert_eq!(probe.precise_calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.presence_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn checks_within_interval_reuse_cached_volume() {
        let probe = Arc::new(FakeProbe::new(-20.0));
        let cache = cache(probe.clone());
        let t0 = Utc::now();

        cache.check_at(&root(), t0).await.unwrap();
        *probe.volume_db.lock().unwrap() = -5.0;

        let a = cache
            .check_at(&root(), t0 + chrono::Duration::seconds(10))
            .await
            .unwrap();
        let b = cache
            .check_at(&root(), t0 + chrono::Duration::seconds(29))
            .await
            .unwrap();

        assert_eq!(a.method, AudioMethod::PresenceCachedVolume);
        assert_eq!(a.volume_db, b.volume_db);
        assert_eq!(a.volume_db, Some(-20.0));
        assert_eq!(probe.precise_calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.presence_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_reading_triggers_new_precise_measurement() {
        let probe = Arc::new(FakeProbe::new(-20.0));
        let cache = cache(probe.clone());
        let t0 = Utc::now();

        cache.check_at(&root(), t0).await.unwrap();
        *probe.volume_db.lock().unwrap() = -5.0;
        let reading = cache
            .check_at(&root(), t0 + chrono::Duration::seconds(30))
            .await
            .unwrap();

        assert_eq!(reading.method, AudioMethod::Precise);
        assert_eq!(reading.volume_db, Some(-5.0));
        assert_eq!(probe.precise_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_stream_reports_no_audio_despite_cache() {
        let probe = Arc::new(FakeProbe::new(-20.0));
        let cache = cache(probe.clone());
        let t0 = Utc::now();

        cache.check_at(&root(), t0).await.unwrap();
        probe.presence.store(false, Ordering::SeqCst);
        let reading = cache
            .check_at(&root(), t0 + chrono::Duration::seconds(5))
            .await
            .unwrap();

        assert!(!reading.present);
        assert_eq!(reading.volume_db, None);
        assert_eq!(reading.method, AudioMethod::Presence);
        assert_eq!(
            cache.entry("dev1").await.unwrap().volume_db,
            -20.0,
            "cached volume survives a failed presence probe"
        );
    }

    #[tokio::test]
    async fn silent_stream_is_not_present() {
        let probe = Arc::new(FakeProbe::new(-91.0));
        let cache = cache(probe.clone());
        let t0 = Utc::now();

        assert!(!cache.check_at(&root(), t0).await.unwrap().present);
        let cached = cache
            .check_at(&root(), t0 + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(!cached.present);
        assert_eq!(cached.volume_percent, Some(0));
    }

    #[tokio::test]
    async fn failed_measurement_on_dead_stream_reads_as_no_audio() {
        let probe = Arc::new(FakeProbe::new(-20.0));
        let cache = cache(probe.clone());
        let t0 = Utc::now();

        cache.check_at(&root(), t0).await.unwrap();
        probe.presence.store(false, Ordering::SeqCst);
        probe.precise_fails.store(true, Ordering::SeqCst);

        let reading = cache
            .check_at(&root(), t0 + chrono::Duration::seconds(31))
            .await
            .unwrap();

        assert!(!reading.present);
        assert_eq!(reading.volume_db, None);
        assert_eq!(reading.method, AudioMethod::Presence);
        assert!(cache.entry("dev1").await.is_none());
    }

    #[tokio::test]
    async fn failed_measurement_on_live_stream_is_an_error() {
        let probe = Arc::new(FakeProbe::new(-20.0));
        probe.precise_fails.store(true, Ordering::SeqCst);
        let cache = cache(probe.clone());

        assert!(cache.check_at(&root(), Utc::now()).await.is_err());
        assert_eq!(probe.presence_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn device_without_audio_files_reads_as_no_audio() {
        let dir = tempfile::tempdir().unwrap();
        let root = CaptureRoot::under("dev1", dir.path());
        root.ensure_layout().unwrap();
        let cache = AudioCache::new(
            Arc::new(FfmpegAudioProbe::new(Duration::from_secs(1))),
            Duration::from_secs(30),
            -50.0,
        );

        let reading = cache.check_at(&root, Utc::now()).await.unwrap();

        assert!(!reading.present);
        assert_eq!(reading.method, AudioMethod::Precise);
    }
}
