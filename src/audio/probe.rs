use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::layout::{list_hot_files, CaptureRoot, Category};

/// External audio measurement primitives.
#[async_trait]
pub trait AudioProbe: Send + Sync {
    /// Cheap check that an audio stream exists at all. No volume data.
    async fn probe_presence(&self, root: &CaptureRoot) -> Result<bool>;

    /// Decode recent audio and return its mean volume in dB. `None` when the
    /// device has no audio stream to decode.
    async fn measure_volume(&self, root: &CaptureRoot) -> Result<Option<f64>>;
}

/// Probes the newest hot audio file (or segment when the device has no
/// separate audio track) with `ffprobe` / `ffmpeg -af volumedetect`.
pub struct FfmpegAudioProbe {
    timeout: Duration,
}

impl FfmpegAudioProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<std::process::Output> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("{program} timed out after {}s", self.timeout.as_secs()))?
            .with_context(|| format!("{program} did not complete"))
    }
}

#[async_trait]
impl AudioProbe for FfmpegAudioProbe {
    async fn probe_presence(&self, root: &CaptureRoot) -> Result<bool> {
        let Some(source) = locate_source(root).await? else {
            return Ok(false);
        };

        let args = vec![
            "-v".to_owned(),
            "error".to_owned(),
            "-select_streams".to_owned(),
            "a".to_owned(),
            "-show_entries".to_owned(),
            "stream=codec_type".to_owned(),
            "-of".to_owned(),
            "csv=p=0".to_owned(),
            source.display().to_string(),
        ];
        let output = self.run("ffprobe", &args).await?;
        if !output.status.success() {
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|line| line.trim() == "audio"))
    }

    async fn measure_volume(&self, root: &CaptureRoot) -> Result<Option<f64>> {
        let Some(source) = locate_source(root).await? else {
            return Ok(None);
        };

        let args = vec![
            "-hide_banner".to_owned(),
            "-nostats".to_owned(),
            "-i".to_owned(),
            source.display().to_string(),
            "-vn".to_owned(),
            "-sn".to_owned(),
            "-dn".to_owned(),
            "-af".to_owned(),
            "volumedetect".to_owned(),
            "-f".to_owned(),
            "null".to_owned(),
            "-".to_owned(),
        ];
        let output = self.run("ffmpeg", &args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if reports_no_audio_stream(&stderr) {
                return Ok(None);
            }
            bail!(
                "ffmpeg volumedetect failed on {} (status {:?})",
                source.display(),
                output.status.code()
            );
        }
        // volumedetect prints nothing when no samples were decoded
        Ok(parse_mean_volume(&stderr))
    }
}

async fn locate_source(root: &CaptureRoot) -> Result<Option<PathBuf>> {
    let root = root.clone();
    tokio::task::spawn_blocking(move || newest_audio_source(&root))
        .await
        .context("audio source lookup join failed")
}

/// ffmpeg refuses to run when `-vn` leaves the output without streams.
fn reports_no_audio_stream(stderr: &str) -> bool {
    stderr.contains("does not contain any stream") || stderr.contains("matches no streams")
}

fn newest_audio_source(root: &CaptureRoot) -> Option<PathBuf> {
    [Category::Audio, Category::Segments]
        .into_iter()
        .find_map(|category| newest_in(&root.hot_category_dir(category)))
}

fn newest_in(dir: &Path) -> Option<PathBuf> {
    list_hot_files(dir).ok()?.pop().map(|file| file.path)
}

/// Extract `mean_volume: -23.4 dB` from volumedetect's stderr.
pub fn parse_mean_volume(stderr: &str) -> Option<f64> {
    stderr.lines().find_map(|line| {
        let (_, rest) = line.split_once("mean_volume:")?;
        rest.trim().trim_end_matches("dB").trim().parse::<f64>().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_volumedetect_output() {
        let stderr = "\
[Parsed_volumedetect_0 @ 0x55] n_samples: 88200
[Parsed_volumedetect_0 @ 0x55] mean_volume: -23.4 dB
[Parsed_volumedetect_0 @ 0x55] max_volume: -4.0 dB";
        assert_eq!(parse_mean_volume(stderr), Some(-23.4));
        assert_eq!(parse_mean_volume("no stats here"), None);
    }

    #[test]
    fn missing_audio_track_is_recognized() {
        assert!(reports_no_audio_stream(
            "Output file #0 does not contain any stream\n"
        ));
        assert!(reports_no_audio_stream(
            "Stream specifier 'a' in filtergraph description volumedetect matches no streams."
        ));
        assert!(!reports_no_audio_stream("Invalid data found when processing input"));
    }

    #[test]
    fn audio_source_prefers_audio_then_segments() {
        let dir = tempdir().unwrap();
        let root = CaptureRoot::under("dev1", dir.path());
        root.ensure_layout().unwrap();

        assert_eq!(newest_audio_source(&root), None);

        let segments = root.hot_category_dir(Category::Segments);
        std::fs::write(segments.join("segment_1.ts"), b"x").unwrap();
        std::fs::write(segments.join("segment_2.ts"), b"x").unwrap();
        assert_eq!(newest_audio_source(&root), Some(segments.join("segment_2.ts")));

        let audio = root.hot_category_dir(Category::Audio);
        std::fs::write(audio.join("audio_5.ts"), b"x").unwrap();
        assert_eq!(newest_audio_source(&root), Some(audio.join("audio_5.ts")));
    }

    #[tokio::test]
    async fn presence_without_source_is_false() {
        let dir = tempdir().unwrap();
        let root = CaptureRoot::under("dev1", dir.path());
        let probe = FfmpegAudioProbe::new(Duration::from_secs(1));
        assert!(!probe.probe_presence(&root).await.unwrap());
        assert_eq!(probe.measure_volume(&root).await.unwrap(), None);
    }
}
