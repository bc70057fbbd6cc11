pub mod archiver;
pub mod audio;
pub mod cli;
pub mod daemon;
pub mod db;
pub mod incidents;
pub mod layout;
pub mod metrics;
pub mod monitor;
pub mod settings;
pub mod upload;
pub mod utils;

use anyhow::{Context, Result};
use clap::Parser;

use archiver::TieringArchiver;
use cli::{Cli, Command};
use db::Database;
use settings::Settings;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    utils::logging::init();

    let settings = Settings::load(&cli.config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("capkeep-worker")
        .build()
        .context("failed to build tokio runtime")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            log::info!("capkeep starting up (config {})", cli.config.display());
            runtime.block_on(daemon::run_daemon(settings))
        }
        Command::ArchiveOnce => {
            let mut archiver = TieringArchiver::new(
                settings.capture_roots()?,
                settings.hot_limits.clone(),
                settings.archiver.clone(),
                settings.hour_clock(),
            );
            let report = archiver.run_cycle();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Setup => {
            for root in settings.capture_roots()? {
                root.ensure_layout()?;
                log::info!(
                    "provisioned device={} hot={} cold={}",
                    root.device_id,
                    root.hot_dir.display(),
                    root.cold_dir.display()
                );
            }
            Ok(())
        }
        Command::Incidents { device, open } => runtime.block_on(async {
            let db = Database::new(settings.database_path.clone())?;
            let incidents = db.list_incidents(device, open).await?;
            println!("{}", serde_json::to_string_pretty(&incidents)?);
            Ok::<(), anyhow::Error>(())
        }),
    }
}
