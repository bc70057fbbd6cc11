use anyhow::{bail, Result};
use log::{error, info};
use notify::RecommendedWatcher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::layout::Category;

use super::handler::FrameHandler;
use super::loop_worker::monitor_loop;
use super::watcher::watch_frames;

struct DeviceMonitor {
    device_id: String,
    handle: JoinHandle<()>,
    watcher: RecommendedWatcher,
}

/// Owns one watcher and one worker task per device.
pub struct MonitorController {
    monitors: Vec<DeviceMonitor>,
    cancel_token: Option<CancellationToken>,
}

impl MonitorController {
    pub fn new() -> Self {
        Self {
            monitors: Vec::new(),
            cancel_token: None,
        }
    }

    /// Start watching every handler's capture directory. A device whose
    /// directory cannot be watched is reported and skipped.
    pub fn start(
        &mut self,
        handlers: Vec<FrameHandler>,
        catch_up_frames: usize,
        channel_capacity: usize,
    ) -> Result<usize> {
        if self.cancel_token.is_some() {
            bail!("monitors already running");
        }
        let cancel_token = CancellationToken::new();

        for handler in handlers {
            let device_id = handler.root().device_id.clone();
            let dir = handler.root().hot_category_dir(Category::Captures);
            let (tx, rx) = mpsc::channel(channel_capacity.max(1));

            // Watch before catch-up so frames landing in between are queued.
            let watcher = match watch_frames(&dir, tx) {
                Ok(watcher) => watcher,
                Err(err) => {
                    error!("cannot monitor device {device_id}: {err:#}");
                    continue;
                }
            };

            let handle = tokio::spawn(monitor_loop(handler, rx, catch_up_frames, cancel_token.clone()));
            info!("monitoring {} ({})", device_id, dir.display());
            self.monitors.push(DeviceMonitor {
                device_id,
                handle,
                watcher,
            });
        }

        self.cancel_token = Some(cancel_token);
        Ok(self.monitors.len())
    }

    /// Cancel and join every worker. All workers are joined even when one of
    /// them panicked; the failures are reported together afterwards.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        let mut failed = Vec::new();
        for monitor in self.monitors.drain(..) {
            drop(monitor.watcher);
            if let Err(err) = monitor.handle.await {
                error!("monitor task for {} failed to join: {err}", monitor.device_id);
                failed.push(monitor.device_id);
            }
        }
        if !failed.is_empty() {
            bail!("monitor tasks failed for {}", failed.join(", "));
        }
        Ok(())
    }
}

impl Default for MonitorController {
    fn default() -> Self {
        Self::new()
    }
}
