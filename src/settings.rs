use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::{fs, path::Path, path::PathBuf, time::Duration};

use crate::incidents::AnomalyKind;
use crate::layout::{CaptureRoot, Category, HourClock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub id: String,
    /// Shorthand for `root/hot` + `root/cold`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub hot_dir: Option<PathBuf>,
    #[serde(default)]
    pub cold_dir: Option<PathBuf>,
}

impl DeviceSettings {
    pub fn capture_root(&self) -> Result<CaptureRoot> {
        let base = self.root.as_ref();
        let hot = self
            .hot_dir
            .clone()
            .or_else(|| base.map(|root| root.join("hot")));
        let cold = self
            .cold_dir
            .clone()
            .or_else(|| base.map(|root| root.join("cold")));
        match (hot, cold) {
            (Some(hot), Some(cold)) => Ok(CaptureRoot::new(self.id.clone(), hot, cold)),
            _ => bail!(
                "device '{}' needs either `root` or both `hot_dir` and `cold_dir`",
                self.id
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotLimits {
    pub segments: usize,
    pub captures: usize,
    pub thumbnails: usize,
    pub metadata: usize,
    pub audio: usize,
}

impl Default for HotLimits {
    fn default() -> Self {
        Self {
            segments: 150,
            captures: 300,
            thumbnails: 300,
            metadata: 300,
            audio: 150,
        }
    }
}

impl HotLimits {
    pub fn limit_for(&self, category: Category) -> usize {
        match category {
            Category::Segments => self.segments,
            Category::Captures => self.captures,
            Category::Thumbnails => self.thumbnails,
            Category::Metadata => self.metadata,
            Category::Audio => self.audio,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverSettings {
    pub interval_secs: u64,
    pub safety_age_secs: u64,
    /// Disk space is sampled once every this many cycles.
    pub disk_check_every_cycles: u64,
    pub low_space_percent: f64,
    pub critical_space_percent: f64,
    /// `#EXTINF` duration written into cold segment playlists.
    pub segment_duration_secs: f64,
}

impl Default for ArchiverSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            safety_age_secs: 30,
            disk_check_every_cycles: 12,
            low_space_percent: 15.0,
            critical_space_percent: 5.0,
            segment_duration_secs: 1.0,
        }
    }
}

impl ArchiverSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn safety_age(&self) -> Duration {
        Duration::from_secs(self.safety_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// Luma at or below this counts as a dark pixel.
    pub dark_luma: u8,
    pub blackscreen_ratio: f64,
    /// Mean absolute luma difference below which two frames count as identical.
    pub freeze_threshold: f64,
    pub macroblock_ratio: f64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            dark_luma: 16,
            blackscreen_ratio: 0.95,
            freeze_threshold: 0.5,
            macroblock_ratio: 2.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub catch_up_frames: usize,
    pub channel_capacity: usize,
    pub metrics_log_every: u64,
    pub analyzer: AnalyzerSettings,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            catch_up_frames: 10,
            channel_capacity: 256,
            metrics_log_every: 100,
            analyzer: AnalyzerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationDelays {
    pub blackscreen: u64,
    pub freeze: u64,
    pub macroblocks: u64,
    pub audio_loss: u64,
}

impl Default for ConfirmationDelays {
    fn default() -> Self {
        Self {
            blackscreen: 10,
            freeze: 10,
            macroblocks: 5,
            audio_loss: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentSettings {
    pub confirmation_delay_secs: ConfirmationDelays,
}

impl IncidentSettings {
    pub fn delay_for(&self, kind: AnomalyKind) -> Duration {
        let delays = &self.confirmation_delay_secs;
        let secs = match kind {
            AnomalyKind::Blackscreen => delays.blackscreen,
            AnomalyKind::Freeze => delays.freeze,
            AnomalyKind::Macroblocks => delays.macroblocks,
            AnomalyKind::AudioLoss => delays.audio_loss,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub precise_interval_secs: u64,
    pub silence_threshold_db: f64,
    pub probe_timeout_secs: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            precise_interval_secs: 30,
            silence_threshold_db: -50.0,
            probe_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Destination for the directory-backed sink. Uploads are disabled when unset.
    pub sink_dir: Option<PathBuf>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    /// How often evidence that ran out of attempts is queued again.
    pub sweep_interval_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            sink_dir: None,
            max_attempts: 6,
            initial_backoff_ms: 1000,
            max_backoff_secs: 60,
            sweep_interval_secs: 300,
        }
    }
}

impl UploadSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSetting {
    #[default]
    Utc,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub devices: Vec<DeviceSettings>,
    pub hot_limits: HotLimits,
    pub archiver: ArchiverSettings,
    pub monitor: MonitorSettings,
    pub incidents: IncidentSettings,
    pub audio: AudioSettings,
    pub upload: UploadSettings,
    pub clock: ClockSetting,
    pub database_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            hot_limits: HotLimits::default(),
            archiver: ArchiverSettings::default(),
            monitor: MonitorSettings::default(),
            incidents: IncidentSettings::default(),
            audio: AudioSettings::default(),
            upload: UploadSettings::default(),
            clock: ClockSetting::default(),
            database_path: PathBuf::from("capkeep.sqlite3"),
        }
    }
}

impl Settings {
    /// Read settings from `path`. A missing file yields defaults; a malformed
    /// one is an error so a typo never silently runs with default limits.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse settings in {}", path.display()))?
        } else {
            log::warn!(
                "Settings file {} not found; using defaults",
                path.display()
            );
            Settings::default()
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.archiver.critical_space_percent >= self.archiver.low_space_percent {
            bail!(
                "archiver.critical_space_percent ({}) must be below low_space_percent ({})",
                self.archiver.critical_space_percent,
                self.archiver.low_space_percent
            );
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                bail!("device id must not be empty");
            }
            if !seen.insert(device.id.as_str()) {
                bail!("duplicate device id '{}'", device.id);
            }
            device.capture_root()?;
        }
        Ok(())
    }

    pub fn capture_roots(&self) -> Result<Vec<CaptureRoot>> {
        self.devices.iter().map(DeviceSettings::capture_root).collect()
    }

    pub fn hour_clock(&self) -> HourClock {
        match self.clock {
            ClockSetting::Utc => HourClock::utc(),
            ClockSetting::Local => HourClock::local(),
        }
    }

    pub fn precise_interval(&self) -> Duration {
        Duration::from_secs(self.audio.precise_interval_secs)
    }
}
