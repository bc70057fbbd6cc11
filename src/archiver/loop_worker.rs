use std::sync::{Arc, Mutex};

use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::TieringArchiver;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const CYCLE_TIMEOUT_SECS: u64 = 120;

/// Run archive cycles every `interval` on the blocking pool until cancelled.
pub async fn archiver_loop(
    archiver: TieringArchiver,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let archiver = Arc::new(Mutex::new(archiver));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let archiver = Arc::clone(&archiver);
                let cycle = tokio::task::spawn_blocking(move || {
                    let mut archiver = archiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    archiver.run_cycle()
                });

                match tokio::time::timeout(Duration::from_secs(CYCLE_TIMEOUT_SECS), cycle).await {
                    Ok(Ok(_report)) => {}
                    Ok(Err(err)) => log_error!("archive cycle panicked: {err}"),
                    Err(_) => log_warn!("archive cycle still running after {}s", CYCLE_TIMEOUT_SECS),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("archiver loop shutting down");
                break;
            }
        }
    }
}
