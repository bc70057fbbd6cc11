use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::layout::{list_hot_files, write_atomic};

pub const PLAYLIST_NAME: &str = "archive.m3u8";

/// Rewrite the VOD playlist for one cold segments bucket. Entries are ordered
/// by modification time, ties broken by sequence. Returns the entry count.
pub fn write_bucket_playlist(bucket: &Path, segment_duration_secs: f64) -> Result<usize> {
    let mut segments = Vec::new();
    for file in list_hot_files(bucket)
        .with_context(|| format!("failed to list bucket {}", bucket.display()))?
    {
        let modified = match fs::metadata(&file.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        segments.push((modified, file));
    }
    segments.sort_by(|(a_time, a), (b_time, b)| {
        a_time
            .cmp(b_time)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });

    let names: Vec<(u64, &str)> = segments
        .iter()
        .map(|(_, file)| (file.sequence, file.name.as_str()))
        .collect();
    let body = render(&names, segment_duration_secs);
    write_atomic(&bucket.join(PLAYLIST_NAME), body.as_bytes())?;
    Ok(names.len())
}

fn render(segments: &[(u64, &str)], duration: f64) -> String {
    let duration = if duration > 0.0 { duration } else { 1.0 };
    let mut out = String::new();
    out.push_str("#EXTM3U\n#EXT-X-VERSION:3\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", duration.ceil() as u64);
    let first = segments.first().map(|(seq, _)| *seq).unwrap_or(0);
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{first}");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    for (_, name) in segments {
        let _ = writeln!(out, "#EXTINF:{duration:.3},");
        let _ = writeln!(out, "{name}");
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[test]
    fn playlist_follows_modification_order() {
        let dir = tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(600);
        // segment_9 was written first (before the encoder wrapped around)
        for (name, offset) in [("segment_9.ts", 0), ("segment_1.ts", 10), ("segment_2.ts", 20)] {
            let path = dir.path().join(name);
            fs::write(&path, b"ts").unwrap();
            File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(base + Duration::from_secs(offset))
                .unwrap();
        }

        let count = write_bucket_playlist(dir.path(), 1.0).unwrap();
        let playlist = fs::read_to_string(dir.path().join(PLAYLIST_NAME)).unwrap();

        assert_eq!(count, 3);
        let entries: Vec<&str> = playlist.lines().filter(|l| l.ends_with(".ts")).collect();
        assert_eq!(entries, vec!["segment_9.ts", "segment_1.ts", "segment_2.ts"]);
        assert!(playlist.starts_with("#EXTM3U"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:9"));
        assert!(playlist.trim_end().ends_with("#EXT-X-ENDLIST"));
    }

    #[test]
    fn empty_bucket_gets_empty_playlist() {
        let dir = tempdir().unwrap();
        assert_eq!(write_bucket_playlist(dir.path(), 2.0).unwrap(), 0);
        assert!(dir.path().join(PLAYLIST_NAME).exists());
    }
}
