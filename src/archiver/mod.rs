//! Hot to cold tiering.
//!
//! Every cycle trims each hot category back to its limit by moving the oldest
//! files into the cold bucket for the current wall-clock hour. Buckets are
//! reused every 24h and same-named files overwrite, so cold storage never
//! needs a deletion pass.

pub mod disk;
mod loop_worker;
pub mod manifest;

pub use disk::{DiskMonitor, DiskUsage, SpaceLevel};
pub use loop_worker::archiver_loop;

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::layout::{bucket_name, list_hot_files, move_file, CaptureRoot, Category, HourClock};
use crate::settings::{ArchiverSettings, HotLimits};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryReport {
    pub device_id: String,
    pub category: Option<Category>,
    pub listed: usize,
    pub moved: usize,
    pub failed: usize,
    pub vanished: usize,
    pub skipped_young: usize,
    /// Hot occupancy after the cycle.
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub hour: String,
    pub categories: Vec<CategoryReport>,
    /// `device/category` pairs whose hot directory does not exist.
    pub missing: Vec<String>,
    pub disk: Vec<DiskUsage>,
}

impl CycleReport {
    pub fn moved(&self) -> usize {
        self.categories.iter().map(|c| c.moved).sum()
    }

    pub fn failed(&self) -> usize {
        self.categories.iter().map(|c| c.failed).sum()
    }
}

pub struct TieringArchiver {
    roots: Vec<CaptureRoot>,
    limits: HotLimits,
    settings: ArchiverSettings,
    clock: HourClock,
    disk: Option<DiskMonitor>,
    cycles: u64,
}

impl TieringArchiver {
    pub fn new(
        roots: Vec<CaptureRoot>,
        limits: HotLimits,
        settings: ArchiverSettings,
        clock: HourClock,
    ) -> Self {
        let disk = (settings.disk_check_every_cycles > 0).then(|| {
            DiskMonitor::new(settings.low_space_percent, settings.critical_space_percent)
        });
        Self {
            roots,
            limits,
            settings,
            clock,
            disk,
            cycles: 0,
        }
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(Utc::now())
    }

    /// One pass over every (device, category). Failures are contained to the
    /// file or directory they happen on.
    pub fn run_cycle_at(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.cycles += 1;
        let hour = self.clock.hour_at(now);
        let wall = SystemTime::from(now);

        let mut report = CycleReport {
            started_at: now,
            hour: bucket_name(hour),
            categories: Vec::new(),
            missing: Vec::new(),
            disk: Vec::new(),
        };

        for root in &self.roots {
            for category in Category::ALL {
                match self.archive_category(root, category, hour, wall) {
                    Some(category_report) => report.categories.push(category_report),
                    None => report.missing.push(format!("{}/{}", root.device_id, category)),
                }
            }
        }

        let every = self.settings.disk_check_every_cycles;
        if let Some(disk) = self.disk.as_mut() {
            if every > 0 && (self.cycles - 1) % every == 0 {
                let cold_dirs: Vec<_> = self
                    .roots
                    .iter()
                    .map(|root| disk::existing_ancestor(&root.cold_dir))
                    .collect();
                report.disk = disk.sample(&cold_dirs);
            }
        }

        log_debug!(
            "archive cycle={} hour={} moved={} failed={} missing={}",
            self.cycles,
            report.hour,
            report.moved(),
            report.failed(),
            report.missing.len()
        );
        report
    }

    /// `None` when the hot category directory is missing.
    fn archive_category(
        &self,
        root: &CaptureRoot,
        category: Category,
        hour: u32,
        wall: SystemTime,
    ) -> Option<CategoryReport> {
        let hot_dir = root.hot_category_dir(category);
        let files = match list_hot_files(&hot_dir) {
            Ok(files) => files,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log_debug!("skipping missing hot dir {}", hot_dir.display());
                return None;
            }
            Err(err) => {
                log_warn!("failed to list {}: {err}", hot_dir.display());
                return None;
            }
        };

        let limit = self.limits.limit_for(category);
        let mut report = CategoryReport {
            device_id: root.device_id.clone(),
            category: Some(category),
            listed: files.len(),
            ..CategoryReport::default()
        };

        let excess = files.len().saturating_sub(limit);
        if excess > 0 {
            let bucket = root.cold_bucket_dir(category, hour);
            let safety_age = self.settings.safety_age();

            for file in &files {
                if report.moved + report.failed + report.vanished >= excess {
                    break;
                }
                let modified = match fs::metadata(&file.path).and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        report.vanished += 1;
                        continue;
                    }
                    Err(err) => {
                        log_warn!("cannot stat {}: {err}", file.path.display());
                        report.failed += 1;
                        continue;
                    }
                };
                // mtime in the future counts as brand new
                let age = wall.duration_since(modified).unwrap_or(Duration::ZERO);
                if age < safety_age {
                    report.skipped_young += 1;
                    continue;
                }

                match move_into_bucket(&file.path, &bucket, &file.name) {
                    Ok(()) => report.moved += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        log_debug!("hot file vanished before move: {}", file.path.display());
                        report.vanished += 1;
                    }
                    Err(err) => {
                        log_warn!(
                            "move failed device={} category={} file={}: {err}",
                            root.device_id,
                            category,
                            file.name
                        );
                        report.failed += 1;
                    }
                }
            }

            if category.is_playable() && report.moved > 0 {
                if let Err(err) = manifest::write_bucket_playlist(&bucket, self.settings.segment_duration_secs) {
                    log_warn!("playlist update failed for {}: {err:#}", bucket.display());
                }
            }
        }

        report.remaining = report.listed - report.moved - report.vanished;
        if report.moved > 0 || report.failed > 0 {
            log_info!(
                "archived device={} category={} moved={} failed={} young={} hot={} limit={} hour={}",
                root.device_id,
                category,
                report.moved,
                report.failed,
                report.skipped_young,
                report.remaining,
                limit,
                bucket_name(hour)
            );
        }
        Some(report)
    }
}

/// Move into the bucket, recreating it once if it was removed from under us.
fn move_into_bucket(src: &Path, bucket: &Path, name: &str) -> io::Result<()> {
    let dst = bucket.join(name);
    match move_file(src, &dst) {
        Err(err) if err.kind() == io::ErrorKind::NotFound && !bucket.exists() && src.exists() => {
            log_warn!("recreating missing cold bucket {}", bucket.display());
            fs::create_dir_all(bucket)?;
            move_file(src, &dst)
        }
        other => other,
    }
}
