use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::GrayImage;

use crate::settings::AnalyzerSettings;

const FINGERPRINT_WIDTH: u32 = 64;
const FINGERPRINT_HEIGHT: u32 = 36;
const BLOCK_SIZE: u32 = 8;

/// Downscaled luma plane kept between frames for freeze detection.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameFingerprint {
    pub width: u32,
    pub height: u32,
    pub luma: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameAnalysis {
    pub blackscreen: bool,
    pub black_ratio: f64,
    pub freeze: bool,
    /// Mean absolute luma difference to the previous frame; `None` without one.
    pub freeze_diff: Option<f64>,
    pub macroblocks: bool,
    pub macroblock_score: f64,
    pub fingerprint: FrameFingerprint,
}

/// Picture anomaly detection for one frame. Runs on the blocking pool.
pub trait FrameAnalyzer: Send + Sync {
    fn analyze(&self, frame: &Path, previous: Option<&FrameFingerprint>) -> Result<FrameAnalysis>;

    /// Tag written into metadata records.
    fn method(&self) -> &'static str;
}

pub struct LumaFrameAnalyzer {
    settings: AnalyzerSettings,
}

impl LumaFrameAnalyzer {
    pub fn new(settings: AnalyzerSettings) -> Self {
        Self { settings }
    }
}

impl FrameAnalyzer for LumaFrameAnalyzer {
    fn analyze(&self, frame: &Path, previous: Option<&FrameFingerprint>) -> Result<FrameAnalysis> {
        let gray = image::open(frame)
            .with_context(|| format!("failed to decode frame {}", frame.display()))?
            .to_luma8();

        let small = image::imageops::resize(
            &gray,
            FINGERPRINT_WIDTH,
            FINGERPRINT_HEIGHT,
            FilterType::Triangle,
        );
        let fingerprint = FrameFingerprint {
            width: small.width(),
            height: small.height(),
            luma: small.into_raw(),
        };

        let black_ratio = dark_ratio(&fingerprint.luma, self.settings.dark_luma);
        let blackscreen = black_ratio >= self.settings.blackscreen_ratio;

        let freeze_diff = previous
            .filter(|prev| prev.width == fingerprint.width && prev.height == fingerprint.height)
            .map(|prev| mean_abs_diff(&prev.luma, &fingerprint.luma));
        let freeze = freeze_diff
            .map(|diff| diff < self.settings.freeze_threshold)
            .unwrap_or(false);

        let macroblock_score = blockiness(&gray);
        let macroblocks = !blackscreen && macroblock_score >= self.settings.macroblock_ratio;

        Ok(FrameAnalysis {
            blackscreen,
            black_ratio,
            freeze,
            freeze_diff,
            macroblocks,
            macroblock_score,
            fingerprint,
        })
    }

    fn method(&self) -> &'static str {
        "image-luma"
    }
}

fn dark_ratio(luma: &[u8], dark_luma: u8) -> f64 {
    if luma.is_empty() {
        return 0.0;
    }
    let dark = luma.iter().filter(|&&p| p <= dark_luma).count();
    dark as f64 / luma.len() as f64
}

fn mean_abs_diff(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return f64::MAX;
    }
    let total: u64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| u64::from(x.abs_diff(y)))
        .sum();
    total as f64 / a.len() as f64
}

/// Ratio of horizontal gradient on 8px block boundaries to the gradient
/// inside blocks. Clean video sits near 1.0; blocky decode errors spike it.
fn blockiness(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width <= BLOCK_SIZE || height == 0 {
        return 0.0;
    }

    let (mut edge_sum, mut edge_count) = (0u64, 0u64);
    let (mut inner_sum, mut inner_count) = (0u64, 0u64);
    // every other row is plenty and halves the cost on small boards
    for y in (0..height).step_by(2) {
        for x in 1..width {
            let d = u64::from(gray.get_pixel(x, y)[0].abs_diff(gray.get_pixel(x - 1, y)[0]));
            if x % BLOCK_SIZE == 0 {
                edge_sum += d;
                edge_count += 1;
            } else {
                inner_sum += d;
                inner_count += 1;
            }
        }
    }

    let edge_mean = edge_sum as f64 / edge_count.max(1) as f64;
    let inner_mean = inner_sum as f64 / inner_count.max(1) as f64;
    (edge_mean + 1.0) / (inner_mean + 1.0)
}
