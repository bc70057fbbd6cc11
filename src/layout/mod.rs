//! On-disk contract shared by the encoder, the archiver and the monitor.
//!
//! ```text
//! <hot_dir>/<category>/<sequence-named file>
//! <cold_dir>/<category>/<00..23>/<same file name>
//! ```
//!
//! Hot files only appear under their final name once fully written (temp name
//! then rename). Cold hour buckets are created up front and files inside them
//! are overwritten, never deleted, which gives the 24 hour rotation.

mod clock;
mod fs_ops;

pub use clock::HourClock;
pub use fs_ops::{copy_file, move_file, write_atomic};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const HOURS_PER_DAY: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Segments,
    Captures,
    Thumbnails,
    Metadata,
    Audio,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Segments,
        Category::Captures,
        Category::Thumbnails,
        Category::Metadata,
        Category::Audio,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Category::Segments => "segments",
            Category::Captures => "captures",
            Category::Thumbnails => "thumbnails",
            Category::Metadata => "metadata",
            Category::Audio => "audio",
        }
    }

    /// Categories whose cold buckets carry a playlist that must follow their content.
    pub fn is_playable(&self) -> bool {
        matches!(self, Category::Segments)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Hot and cold trees owned by one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRoot {
    pub device_id: String,
    pub hot_dir: PathBuf,
    pub cold_dir: PathBuf,
}

impl CaptureRoot {
    pub fn new(device_id: impl Into<String>, hot_dir: PathBuf, cold_dir: PathBuf) -> Self {
        Self {
            device_id: device_id.into(),
            hot_dir,
            cold_dir,
        }
    }

    /// Single-directory form: `<root>/hot` and `<root>/cold`.
    pub fn under(device_id: impl Into<String>, root: &Path) -> Self {
        Self::new(device_id, root.join("hot"), root.join("cold"))
    }

    pub fn hot_category_dir(&self, category: Category) -> PathBuf {
        self.hot_dir.join(category.dir_name())
    }

    pub fn cold_category_dir(&self, category: Category) -> PathBuf {
        self.cold_dir.join(category.dir_name())
    }

    pub fn cold_bucket_dir(&self, category: Category, hour: u32) -> PathBuf {
        self.cold_category_dir(category).join(bucket_name(hour))
    }

    /// Create every hot category directory and all 24 cold buckets per category.
    /// Safe to call on an existing layout.
    pub fn ensure_layout(&self) -> Result<()> {
        for category in Category::ALL {
            let hot = self.hot_category_dir(category);
            fs::create_dir_all(&hot)
                .with_context(|| format!("failed to create hot dir {}", hot.display()))?;
            for hour in 0..HOURS_PER_DAY {
                let bucket = self.cold_bucket_dir(category, hour);
                fs::create_dir_all(&bucket)
                    .with_context(|| format!("failed to create cold bucket {}", bucket.display()))?;
            }
        }
        Ok(())
    }

    /// Metadata record path for a frame: same stem, `.json`, metadata category.
    pub fn metadata_path_for(&self, frame: &Path) -> Option<PathBuf> {
        let stem = frame.file_stem()?.to_str()?;
        Some(
            self.hot_category_dir(Category::Metadata)
                .join(format!("{stem}.json")),
        )
    }

    /// Thumbnail the encoder produces next to each capture frame.
    pub fn thumbnail_path_for(&self, frame: &Path) -> Option<PathBuf> {
        let stem = frame.file_stem()?.to_str()?;
        let ext = frame.extension().and_then(|e| e.to_str()).unwrap_or("jpg");
        Some(
            self.hot_category_dir(Category::Thumbnails)
                .join(format!("{stem}_thumbnail.{ext}")),
        )
    }
}

pub fn bucket_name(hour: u32) -> String {
    format!("{:02}", hour % HOURS_PER_DAY)
}

/// A fully written file in a hot category directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotFile {
    pub path: PathBuf,
    pub name: String,
    pub sequence: u64,
}

/// First run of ASCII digits in the file stem.
pub fn parse_sequence(name: &str) -> Option<u64> {
    let stem = name.split('.').next().unwrap_or(name);
    let start = stem.find(|c: char| c.is_ascii_digit())?;
    let digits: String = stem[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// In-progress writes never count as hot files.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(".tmp")
}

/// Hot files in `dir`, oldest sequence first.
///
/// A missing directory is reported as `io::ErrorKind::NotFound` so callers can
/// skip devices that are not provisioned.
pub fn list_hot_files(dir: &Path) -> io::Result<Vec<HotFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_temp_name(&name) {
            continue;
        }
        match entry.file_type() {
            Ok(kind) if kind.is_file() => {}
            _ => continue,
        }
        let Some(sequence) = parse_sequence(&name) else {
            continue;
        };
        files.push(HotFile {
            path: entry.path(),
            name,
            sequence,
        });
    }
    files.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}
