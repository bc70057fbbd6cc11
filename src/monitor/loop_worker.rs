use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::handler::FrameHandler;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const FRAME_TIMEOUT_SECS: u64 = 30;

/// Per-device worker: catch up on recent frames, then handle watcher events
/// one at a time until cancelled or the watcher goes away.
pub async fn monitor_loop(
    mut handler: FrameHandler,
    mut frames: mpsc::Receiver<PathBuf>,
    catch_up_frames: usize,
    cancel_token: CancellationToken,
) {
    let device_id = handler.root().device_id.clone();

    tokio::select! {
        result = handler.catch_up(catch_up_frames) => match result {
            Ok(analyzed) => log_info!("catch-up done device={} analyzed={}", device_id, analyzed),
            Err(err) => log_warn!("catch-up failed device={}: {err:#}", device_id),
        },
        _ = cancel_token.cancelled() => {
            log_info!("monitor for {} cancelled during catch-up", device_id);
            return;
        }
    }

    loop {
        tokio::select! {
            received = frames.recv() => {
                let Some(frame) = received else {
                    log_warn!("frame watcher for {} closed", device_id);
                    break;
                };
                let fut = handler.handle_frame(&frame);
                match tokio::time::timeout(Duration::from_secs(FRAME_TIMEOUT_SECS), fut).await {
                    Ok(Ok(outcome)) => log_debug!("device={} frame={} outcome={:?}", device_id, frame.display(), outcome),
                    Ok(Err(err)) => log_error!("frame handling failed device={} frame={}: {err:#}", device_id, frame.display()),
                    Err(_) => log_warn!("frame handling timeout (> {}s) device={} frame={}", FRAME_TIMEOUT_SECS, device_id, frame.display()),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("monitor for {} shutting down", device_id);
                break;
            }
        }
    }
}
