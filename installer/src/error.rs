// Error taxonomy
//
// Runtime command failures are classified once, at the docker boundary, and travel through the
// orchestrator as typed values. Install/update failures wrap them with the step they came from.

use std::path::PathBuf;

use crate::models::state::UpdateState;

/// Input rejected before any resource was touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A container runtime command failed. The runtime's raw message is always preserved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeCommandError {
    /// A container, network or volume with that name already exists.
    #[error("name already in use: '{name}' ({raw})")]
    NameInUse { name: String, raw: String },

    /// The requested host port is held by something else.
    #[error("host port {port} is already allocated ({raw})")]
    PortInUse { port: u16, raw: String },

    #[error("not found: '{what}' ({raw})")]
    NotFound { what: String, raw: String },

    /// Daemon not running, not reachable, or permission denied on its socket.
    #[error("container runtime unavailable: {raw}")]
    DaemonUnavailable { raw: String },

    #[error("runtime command timed out (operation={operation}): {raw}")]
    Timeout { operation: String, raw: String },

    #[error("runtime command failed (operation={operation}, exit_code={exit_code:?}): {raw}")]
    Failed {
        operation: String,
        exit_code: Option<i32>,
        raw: String,
    },
}

impl RuntimeCommandError {
    pub fn raw(&self) -> &str {
        match self {
            Self::NameInUse { raw, .. }
            | Self::PortInUse { raw, .. }
            | Self::NotFound { raw, .. }
            | Self::DaemonUnavailable { raw }
            | Self::Timeout { raw, .. }
            | Self::Failed { raw, .. } => raw,
        }
    }

    /// Conflicts caused by something outside the session. These are never retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::NameInUse { .. } | Self::PortInUse { .. })
    }
}

/// Why an install session stopped making forward progress.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallFailure {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Runtime(#[from] RuntimeCommandError),

    #[error("health check for '{target}' did not pass within {deadline_ms}ms: {last_observation}")]
    HealthCheckTimeout {
        target: String,
        deadline_ms: u128,
        last_observation: String,
    },

    /// The database volume is left over from an earlier install. It is never reused or deleted.
    #[error("volume '{name}' already exists; remove it or choose another volume name")]
    ExistingVolume { name: String },

    #[error("JDBC driver provisioning failed: {0}")]
    Driver(String),

    #[error("installation cancelled")]
    Cancelled,
}

/// Why an update session failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateFailure {
    #[error("could not read update descriptor: {0}")]
    Remote(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("checksum mismatch (expected={expected}, actual={actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("swap failed: {0}")]
    SwapFailed(String),

    #[error("post-swap validation failed: {0}")]
    PostSwapValidationFailed(String),

    #[error(
        "restore failed: {reason} (backup kept at {backup_path:?}, staged package at {staged_path:?})"
    )]
    RestoreFailed {
        reason: String,
        backup_path: PathBuf,
        staged_path: PathBuf,
    },

    /// An earlier session stopped mid-way and has not been recovered yet.
    #[error("a previous update was interrupted during {0}")]
    Interrupted(UpdateState),

    #[error("update cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_keeps_raw_message() {
        let e = RuntimeCommandError::Failed {
            operation: "docker_run".to_string(),
            exit_code: Some(125),
            raw: "invalid reference format".to_string(),
        };
        assert_eq!(e.raw(), "invalid reference format");
        assert!(e.to_string().contains("docker_run"));
        assert!(!e.is_conflict());
    }

    #[test]
    fn name_and_port_collisions_are_conflicts() {
        let name = RuntimeCommandError::NameInUse {
            name: "jira10.0.0".to_string(),
            raw: "Conflict".to_string(),
        };
        let port = RuntimeCommandError::PortInUse {
            port: 8080,
            raw: "port is already allocated".to_string(),
        };
        assert!(name.is_conflict());
        assert!(port.is_conflict());
    }

    #[test]
    fn restore_failure_names_both_paths() {
        let e = UpdateFailure::RestoreFailed {
            reason: "restored executable did not start".to_string(),
            backup_path: PathBuf::from("/opt/jira-installer.backup"),
            staged_path: PathBuf::from("/tmp/jira-installer-update.tmp"),
        };
        let msg = e.to_string();
        assert!(msg.contains("/opt/jira-installer.backup"));
        assert!(msg.contains("/tmp/jira-installer-update.tmp"));
    }
}
