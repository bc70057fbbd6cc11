mod manager;
pub mod state;

pub use manager::IncidentManager;
pub use state::{IncidentAction, IncidentPhase};

use std::str::FromStr;

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Blackscreen,
    Freeze,
    Macroblocks,
    AudioLoss,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 4] = [
        AnomalyKind::Blackscreen,
        AnomalyKind::Freeze,
        AnomalyKind::Macroblocks,
        AnomalyKind::AudioLoss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Blackscreen => "blackscreen",
            AnomalyKind::Freeze => "freeze",
            AnomalyKind::Macroblocks => "macroblocks",
            AnomalyKind::AudioLoss => "audio_loss",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AnomalyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| anyhow!("unknown anomaly kind '{value}'"))
    }
}
