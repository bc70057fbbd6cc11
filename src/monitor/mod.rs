//! Event-driven capture monitoring: watch hot captures, analyze each new
//! frame once, write its metadata record and drive incident detection.

pub mod analysis;
mod controller;
pub mod handler;
mod loop_worker;
pub mod metadata;
pub mod watcher;

pub use analysis::{FrameAnalysis, FrameAnalyzer, FrameFingerprint, LumaFrameAnalyzer};
pub use controller::MonitorController;
pub use handler::FrameHandler;
pub use metadata::MetadataRecord;

use crate::layout::{is_temp_name, parse_sequence};

const FRAME_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// A published capture frame (not a temp write, not a thumbnail).
pub fn is_frame_name(name: &str) -> bool {
    if is_temp_name(name) || parse_sequence(name).is_none() {
        return false;
    }
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    !stem.ends_with("_thumbnail")
        && FRAME_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_names() {
        assert!(is_frame_name("capture_000123.jpg"));
        assert!(is_frame_name("capture_7.PNG"));
        assert!(!is_frame_name("capture_000123_thumbnail.jpg"));
        assert!(!is_frame_name(".capture_000123.jpg.tmp"));
        assert!(!is_frame_name("capture.jpg"));
        assert!(!is_frame_name("capture_1.json"));
    }
}
