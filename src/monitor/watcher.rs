use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::is_frame_name;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Watch `dir` and forward every frame renamed into place to `tx`.
///
/// The returned watcher must be kept alive for events to flow. The notify
/// callback runs on its own thread, so a full channel blocks that thread
/// rather than dropping frames.
pub fn watch_frames(dir: &Path, tx: mpsc::Sender<PathBuf>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for path in visible_paths(&event) {
                let is_frame = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(is_frame_name)
                    .unwrap_or(false);
                if !is_frame {
                    continue;
                }
                if tx.blocking_send(path).is_err() {
                    log_debug!("frame channel closed; dropping watcher event");
                    return;
                }
            }
        }
        Err(err) => log_warn!("watcher error: {err}"),
    })
    .context("failed to create filesystem watcher")?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    Ok(watcher)
}

/// Paths that became visible under their final name. Writers publish by
/// rename, so creates and content writes are ignored.
pub fn visible_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().cloned().into_iter().collect()
        }
        // Some backends cannot tell the two halves of a rename apart.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().filter(|p| p.exists()).cloned().collect()
        }
        _ => Vec::new(),
    }
}
