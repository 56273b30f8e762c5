// Container runtime seam
//
// The orchestrator only talks to this trait. `DockerCli` (docker.rs) is the production
// implementation; tests use an in-memory fake.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::RuntimeCommandError;

/// Everything needed for `docker run -d`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    /// (host, container) port pairs published on the host.
    pub ports: Vec<(u16, u16)>,
    /// Ordered for deterministic command lines.
    pub env: BTreeMap<String, String>,
    /// (source, target) mounts; source may be a named volume or a host path.
    pub mounts: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited(Option<i32>),
    Dead,
    Unknown(String),
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Snapshot for the "status" view.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStatusReport {
    pub containers: String,
    pub networks: String,
    pub volumes: String,
}

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeCommandError>;

    async fn create_network(&self, name: &str) -> Result<(), RuntimeCommandError>;

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeCommandError>;

    /// Create and start a detached container. Returns the container id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeCommandError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeCommandError>;

    /// Looks at every container, running or not. Never cached.
    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeCommandError>;

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeCommandError>;

    /// `docker exec` with extra environment variables (kept off the command line inside the
    /// container).
    async fn exec(
        &self,
        id: &str,
        env: &[(String, String)],
        command: &[String],
    ) -> Result<ExecOutput, RuntimeCommandError>;

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeCommandError>;

    async fn container_logs(&self, id: &str, tail: u32) -> Result<String, RuntimeCommandError>;

    async fn stop_and_remove(&self, id: &str) -> Result<(), RuntimeCommandError>;

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeCommandError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeCommandError>;

    async fn status_report(&self) -> Result<RuntimeStatusReport, RuntimeCommandError>;
}
