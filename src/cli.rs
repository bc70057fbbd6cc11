use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "capkeep")]
#[command(about = "Hot/cold capture tiering and anomaly monitor")]
pub struct Cli {
    /// JSON settings file.
    #[arg(long, global = true, env = "CAPKEEP_CONFIG", default_value = "capkeep.json")]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the archiver and capture monitors until interrupted (default).
    Run,
    /// Run a single archiver cycle and print its report as JSON.
    ArchiveOnce,
    /// Create every hot directory and cold hour bucket for all devices.
    Setup,
    /// Print incident records as JSON.
    Incidents {
        #[arg(long)]
        device: Option<String>,
        /// Only incidents that have not been resolved.
        #[arg(long, default_value_t = false)]
        open: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default() {
        let cli = Cli::try_parse_from(["capkeep", "--config", "/etc/capkeep.json"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("/etc/capkeep.json"));
    }

    #[test]
    fn incidents_filters() {
        let cli = Cli::try_parse_from(["capkeep", "incidents", "--device", "dev2", "--open"]).unwrap();
        match cli.command {
            Some(Command::Incidents { device, open }) => {
                assert_eq!(device.as_deref(), Some("dev2"));
                assert!(open);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn archive_once_parses() {
        let cli = Cli::try_parse_from(["capkeep", "archive-once"]).unwrap();
        assert!(matches!(cli.command, Some(Command::ArchiveOnce)));
    }
}
