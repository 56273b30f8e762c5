// Outcome models (what the core hands back to the caller / UI)
//
// Every session ends in exactly one of these closed outcomes.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::error::{InstallFailure, UpdateFailure};
use crate::models::state::{InstallState, UpdateState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Network,
    Container,
    Volume,
}

/// Something an install session created on the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub id: String,
}

impl Resource {
    pub fn network(id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Network,
            id: id.into(),
        }
    }

    pub fn container(id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Container,
            id: id.into(),
        }
    }

    pub fn volume(id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Volume,
            id: id.into(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ResourceKind::Network => "network",
            ResourceKind::Container => "container",
            ResourceKind::Volume => "volume",
        };
        write!(f, "{} '{}'", kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Success {
        url: String,
        resources: Vec<Resource>,
    },
    /// Forward progress stopped at `failed_step`; every created resource was removed.
    RolledBack {
        failed_step: InstallState,
        reason: InstallFailure,
        torn_down: Vec<Resource>,
    },
    /// Rollback could not remove `leaked`; an operator has to clean them up.
    FailedWithLeak {
        failed_step: InstallState,
        reason: InstallFailure,
        leaked: Vec<Resource>,
    },
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub session_id: String,
    pub final_state: InstallState,
    pub outcome: InstallOutcome,
}

impl InstallReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, InstallOutcome::Success { .. })
    }

    pub fn summary(&self) -> String {
        match &self.outcome {
            InstallOutcome::Success { url, .. } => format!("Jira is up at {}", url),
            InstallOutcome::RolledBack {
                failed_step,
                reason,
                torn_down,
            } => format!(
                "Install failed after {}: {}. Rolled back {} resource(s).",
                failed_step,
                reason,
                torn_down.len()
            ),
            InstallOutcome::FailedWithLeak {
                failed_step,
                reason,
                leaked,
            } => format!(
                "Install failed after {}: {}. Rollback left these behind, remove them manually: {}",
                failed_step,
                reason,
                leaked
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success {
        version: String,
    },
    /// Failed before the live executable was touched.
    NoChange {
        stage: UpdateState,
        reason: UpdateFailure,
    },
    /// Failed after backup; the previous executable is back in place and verified.
    Restored {
        stage: UpdateState,
        reason: UpdateFailure,
    },
    ManualInterventionRequired {
        reason: UpdateFailure,
        backup_path: PathBuf,
        staged_path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub session_id: String,
    pub final_state: UpdateState,
    pub outcome: UpdateOutcome,
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, UpdateOutcome::Success { .. })
    }

    pub fn summary(&self) -> String {
        match &self.outcome {
            UpdateOutcome::Success { version } => format!(
                "Updated to {}. Restart the installer to use the new version.",
                version
            ),
            UpdateOutcome::NoChange { stage, reason } => {
                format!("Update failed during {} (nothing changed): {}", stage, reason)
            }
            UpdateOutcome::Restored { stage, reason } => format!(
                "Update failed during {} and the previous version was restored: {}",
                stage, reason
            ),
            UpdateOutcome::ManualInterventionRequired {
                reason,
                backup_path,
                staged_path,
            } => format!(
                "Update failed and could not be rolled back: {}. Copy {:?} over the installer executable to recover (staged package: {:?}).",
                reason, backup_path, staged_path
            ),
        }
    }
}
