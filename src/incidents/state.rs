use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where one (device, anomaly) pair sits in the confirmation cycle.
///
/// `Resolved` is not stored: resolution closes the incident and the pair goes
/// straight back to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentPhase {
    #[default]
    None,
    Suspected,
    Confirmed,
}

/// Side effect the caller must perform for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentAction {
    None,
    /// First detection: copy evidence to cold storage before eviction.
    PreserveEvidence,
    /// Cleared before the confirmation delay: drop the cold copy, no incident.
    DiscardEvidence,
    /// Persisted long enough: record the incident and upload the evidence.
    Confirm,
    /// Confirmed anomaly cleared: capture closure evidence and close the incident.
    Resolve,
}

/// `elapsed` is the time since first detection and only matters while suspected.
pub fn transition(
    phase: IncidentPhase,
    active: bool,
    elapsed: Duration,
    delay: Duration,
) -> (IncidentPhase, IncidentAction) {
    match (phase, active) {
        (IncidentPhase::None, false) => (IncidentPhase::None, IncidentAction::None),
        (IncidentPhase::None, true) => (IncidentPhase::Suspected, IncidentAction::PreserveEvidence),
        (IncidentPhase::Suspected, false) => (IncidentPhase::None, IncidentAction::DiscardEvidence),
        (IncidentPhase::Suspected, true) => {
            if elapsed >= delay {
                (IncidentPhase::Confirmed, IncidentAction::Confirm)
            } else {
                (IncidentPhase::Suspected, IncidentAction::None)
            }
        }
        (IncidentPhase::Confirmed, true) => (IncidentPhase::Confirmed, IncidentAction::None),
        (IncidentPhase::Confirmed, false) => (IncidentPhase::None, IncidentAction::Resolve),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(3);

    #[test]
    fn first_detection_preserves_evidence() {
        assert_eq!(
            transition(IncidentPhase::None, true, Duration::ZERO, DELAY),
            (IncidentPhase::Suspected, IncidentAction::PreserveEvidence)
        );
        assert_eq!(
            transition(IncidentPhase::None, false, Duration::ZERO, DELAY),
            (IncidentPhase::None, IncidentAction::None)
        );
    }

    #[test]
    fn suspicion_waits_for_delay() {
        assert_eq!(
            transition(IncidentPhase::Suspected, true, Duration::from_secs(2), DELAY),
            (IncidentPhase::Suspected, IncidentAction::None)
        );
        assert_eq!(
            transition(IncidentPhase::Suspected, true, DELAY, DELAY),
            (IncidentPhase::Confirmed, IncidentAction::Confirm)
        );
        assert_eq!(
            transition(IncidentPhase::Suspected, false, Duration::from_secs(2), DELAY),
            (IncidentPhase::None, IncidentAction::DiscardEvidence)
        );
    }

    #[test]
    fn confirmed_holds_until_clear() {
        assert_eq!(
            transition(IncidentPhase::Confirmed, true, Duration::from_secs(60), DELAY),
            (IncidentPhase::Confirmed, IncidentAction::None)
        );
        assert_eq!(
            transition(IncidentPhase::Confirmed, false, Duration::from_secs(60), DELAY),
            (IncidentPhase::None, IncidentAction::Resolve)
        );
    }
}
