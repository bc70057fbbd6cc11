use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::Disks;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceLevel {
    Ok,
    Low,
    Critical,
}

pub fn classify(free_percent: f64, low_percent: f64, critical_percent: f64) -> SpaceLevel {
    if free_percent < critical_percent {
        SpaceLevel::Critical
    } else if free_percent < low_percent {
        SpaceLevel::Low
    } else {
        SpaceLevel::Ok
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub free_percent: f64,
    pub level: SpaceLevel,
}

/// Free-space sampling for the volumes holding cold storage. Only reports;
/// nothing is ever deleted on pressure.
pub struct DiskMonitor {
    disks: Disks,
    low_percent: f64,
    critical_percent: f64,
}

impl DiskMonitor {
    pub fn new(low_percent: f64, critical_percent: f64) -> Self {
        Self {
            disks: Disks::new_with_refreshed_list(),
            low_percent,
            critical_percent,
        }
    }

    /// One entry per distinct volume backing `paths`, logged by level.
    pub fn sample(&mut self, paths: &[PathBuf]) -> Vec<DiskUsage> {
        self.disks.refresh_list();

        let mut by_mount: BTreeMap<PathBuf, DiskUsage> = BTreeMap::new();
        for path in paths {
            let resolved = path.canonicalize().unwrap_or_else(|_| path.clone());
            let Some(disk) = self
                .disks
                .list()
                .iter()
                .filter(|disk| resolved.starts_with(disk.mount_point()))
                .max_by_key(|disk| disk.mount_point().as_os_str().len())
            else {
                log_debug!("no volume found for {}", path.display());
                continue;
            };

            let mount_point = disk.mount_point().to_path_buf();
            if by_mount.contains_key(&mount_point) {
                continue;
            }
            let total_bytes = disk.total_space();
            let available_bytes = disk.available_space();
            let free_percent = free_percent(available_bytes, total_bytes);
            let level = classify(free_percent, self.low_percent, self.critical_percent);
            by_mount.insert(
                mount_point.clone(),
                DiskUsage {
                    mount_point,
                    total_bytes,
                    available_bytes,
                    free_percent,
                    level,
                },
            );
        }

        let usage: Vec<DiskUsage> = by_mount.into_values().collect();
        for disk in &usage {
            report(disk);
        }
        usage
    }
}

fn free_percent(available: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    available as f64 / total as f64 * 100.0
}

fn report(disk: &DiskUsage) {
    let gib = |bytes: u64| bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    match disk.level {
        SpaceLevel::Ok => log_debug!(
            "disk mount={} free_pct={:.1} free_gib={:.1}",
            disk.mount_point.display(),
            disk.free_percent,
            gib(disk.available_bytes)
        ),
        SpaceLevel::Low => log_warn!(
            "low disk space mount={} free_pct={:.1} free_gib={:.1}",
            disk.mount_point.display(),
            disk.free_percent,
            gib(disk.available_bytes)
        ),
        SpaceLevel::Critical => log_error!(
            "critical disk space mount={} free_pct={:.1} free_gib={:.1}",
            disk.mount_point.display(),
            disk.free_percent,
            gib(disk.available_bytes)
        ),
    }
}

/// Longest existing ancestor, for volumes whose cold dir is not created yet.
pub fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf())
}
