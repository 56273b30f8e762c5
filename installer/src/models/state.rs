// Session state machines
//
// NOTE: These are per-session values owned by the orchestrator / update engine. Nothing here is
// process-global; the persisted update marker (update/marker.rs) stores `UpdateState` by name.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallState {
    Validating,
    Validated,
    NetworkReady,
    DatabaseProvisioned,
    ApplicationContainerRunning,
    HealthChecked,
    Completed,
    RollingBack,
    RolledBack,
    Failed,
}

impl InstallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "Validating",
            Self::Validated => "Validated",
            Self::NetworkReady => "NetworkReady",
            Self::DatabaseProvisioned => "DatabaseProvisioned",
            Self::ApplicationContainerRunning => "ApplicationContainerRunning",
            Self::HealthChecked => "HealthChecked",
            Self::Completed => "Completed",
            Self::RollingBack => "RollingBack",
            Self::RolledBack => "RolledBack",
            Self::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateState {
    Idle,
    CheckingRemote,
    Downloading,
    Verifying,
    BackingUp,
    Swapping,
    PostSwapValidating,
    Completed,
    RestoringBackup,
    Restored,
    Failed,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::CheckingRemote => "CheckingRemote",
            Self::Downloading => "Downloading",
            Self::Verifying => "Verifying",
            Self::BackingUp => "BackingUp",
            Self::Swapping => "Swapping",
            Self::PostSwapValidating => "PostSwapValidating",
            Self::Completed => "Completed",
            Self::RestoringBackup => "RestoringBackup",
            Self::Restored => "Restored",
            Self::Failed => "Failed",
        }
    }

    /// A session persisted in one of these states may have left the live executable replaced.
    pub fn touches_live_executable(&self) -> bool {
        matches!(
            self,
            Self::Swapping
                | Self::PostSwapValidating
                | Self::RestoringBackup
                | Self::Restored
                | Self::Failed
        )
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_install_states() {
        assert!(InstallState::Completed.is_terminal());
        assert!(InstallState::RolledBack.is_terminal());
        assert!(InstallState::Failed.is_terminal());
        assert!(!InstallState::RollingBack.is_terminal());
        assert!(!InstallState::NetworkReady.is_terminal());
    }

    #[test]
    fn only_late_update_states_touch_the_live_executable() {
        assert!(!UpdateState::Downloading.touches_live_executable());
        assert!(!UpdateState::Verifying.touches_live_executable());
        assert!(!UpdateState::BackingUp.touches_live_executable());
        assert!(!UpdateState::Completed.touches_live_executable());
        assert!(UpdateState::Swapping.touches_live_executable());
        assert!(UpdateState::PostSwapValidating.touches_live_executable());
        assert!(UpdateState::Failed.touches_live_executable());
    }

    #[test]
    fn update_state_round_trips_through_json_by_name() {
        let json = serde_json::to_string(&UpdateState::Swapping).unwrap();
        assert_eq!(json, "\"Swapping\"");
        let back: UpdateState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UpdateState::Swapping);
    }
}
