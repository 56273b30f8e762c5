// Docker CLI runtime client
//
// Every runtime operation shells out to the docker CLI through the shared command runner.
// Queries (`ls`, `inspect`, `logs`) go through the retrying runner; anything that creates,
// changes or removes state runs exactly once.

use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::RuntimeSettings;
use crate::error::RuntimeCommandError;
use crate::installation::runtime::{
    ContainerSpec, ContainerState, ExecOutput, RuntimeClient, RuntimeStatusReport,
};
use crate::installation::{run_cmd_once, run_cmd_with_timeout, CommandOutput};

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Docker version information.
#[derive(Debug, Clone, Default)]
pub struct DockerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Version string as printed by docker, for display/logging.
    pub raw: String,
}

/// Parse docker version output into a DockerVersion struct.
///
/// Expected format: "Docker version 24.0.5, build abcdef"
pub fn parse_docker_version(output: &str) -> Option<DockerVersion> {
    let output = output.trim();

    let version_str = if let Some(pos) = output.to_lowercase().find("docker version ") {
        &output[pos + "docker version ".len()..]
    } else {
        output
    };

    let version_part = version_str
        .split(|c: char| c == ',' || c == ' ' || c == '-')
        .next()?;

    let parts: Vec<&str> = version_part.split('.').collect();
    let major: u32 = parts.first().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    if major == 0 && minor == 0 && patch == 0 && !version_part.starts_with('0') {
        return None;
    }

    Some(DockerVersion {
        major,
        minor,
        patch,
        raw: output.to_string(),
    })
}

/// Map a failed docker invocation onto the error taxonomy. `subject` is the resource name the
/// command was about (used for name collisions and not-found reports).
pub fn classify_failure(operation: &str, subject: &str, out: &CommandOutput) -> RuntimeCommandError {
    let raw = if out.stderr.trim().is_empty() {
        out.stdout.trim().to_string()
    } else {
        out.stderr.trim().to_string()
    };
    let lower = raw.to_ascii_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("error during connect")
        || lower.contains("permission denied while trying to connect")
        || lower.contains("is the docker daemon running")
    {
        return RuntimeCommandError::DaemonUnavailable { raw };
    }

    if lower.contains("is already in use by container")
        || lower.contains("conflict. the container name")
        || lower.contains("already exists")
    {
        return RuntimeCommandError::NameInUse {
            name: subject.to_string(),
            raw,
        };
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return RuntimeCommandError::PortInUse {
            port: extract_port(&raw).unwrap_or(0),
            raw,
        };
    }

    if lower.contains("no such container")
        || lower.contains("no such network")
        || lower.contains("no such volume")
        || lower.contains("no such object")
        || lower.contains("not found")
    {
        return RuntimeCommandError::NotFound {
            what: subject.to_string(),
            raw,
        };
    }

    RuntimeCommandError::Failed {
        operation: operation.to_string(),
        exit_code: out.exit_code,
        raw,
    }
}

/// Pull the host port out of a bind failure such as
/// "Bind for 0.0.0.0:8080 failed: port is already allocated".
fn extract_port(raw: &str) -> Option<u16> {
    let re = Regex::new(r"(?:\d{1,3}(?:\.\d{1,3}){3}|\[::\]|::):(\d{1,5})").ok()?;
    re.captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse `docker inspect -f '{{.State.Status}} {{.State.ExitCode}}'`.
pub fn parse_container_state(stdout: &str) -> ContainerState {
    let mut parts = stdout.split_whitespace();
    let status = parts.next().unwrap_or("").to_ascii_lowercase();
    let exit_code = parts.next().and_then(|c| c.parse::<i32>().ok());
    match status.as_str() {
        "created" => ContainerState::Created,
        "running" => ContainerState::Running,
        "restarting" => ContainerState::Restarting,
        "paused" => ContainerState::Paused,
        "exited" => ContainerState::Exited(exit_code),
        "dead" => ContainerState::Dead,
        other => ContainerState::Unknown(other.to_string()),
    }
}

/// Arguments for `docker run -d`. Kept separate so the command line can be tested.
pub fn build_run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    if !spec.network.is_empty() {
        args.push("--network".to_string());
        args.push(spec.network.clone());
    }
    for (host, container) in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", host, container));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (source, target) in &spec.mounts {
        args.push("-v".to_string());
        args.push(format!("{}:{}", source, target));
    }
    args.push(spec.image.clone());
    args
}

fn names_contain(stdout: &str, name: &str) -> bool {
    stdout.lines().any(|l| l.trim() == name)
}

pub struct DockerCli {
    program: PathBuf,
    command_timeout: Duration,
    pull_timeout: Duration,
}

impl DockerCli {
    pub fn new(program: impl Into<PathBuf>, command_timeout: Duration, pull_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            command_timeout,
            pull_timeout,
        }
    }

    /// Resolve the docker binary on PATH (or use an absolute path from settings).
    pub fn from_settings(settings: &RuntimeSettings) -> Result<Self, RuntimeCommandError> {
        let program = which::which(&settings.program).map_err(|e| {
            RuntimeCommandError::DaemonUnavailable {
                raw: format!(
                    "'{}' was not found on PATH ({}). Install Docker and try again.",
                    settings.program, e
                ),
            }
        })?;
        debug!(
            "[PHASE: installation] [STEP: docker] Using docker CLI at {:?}",
            program
        );
        Ok(Self::new(
            program,
            Duration::from_secs(settings.command_timeout_secs),
            Duration::from_secs(settings.pull_timeout_secs),
        ))
    }

    fn runner_error(operation: &str, e: anyhow::Error) -> RuntimeCommandError {
        let raw = format!("{:#}", e);
        if raw.contains("timed out") {
            RuntimeCommandError::Timeout {
                operation: operation.to_string(),
                raw,
            }
        } else if raw.contains("Failed to spawn command") {
            RuntimeCommandError::DaemonUnavailable { raw }
        } else {
            RuntimeCommandError::Failed {
                operation: operation.to_string(),
                exit_code: None,
                raw,
            }
        }
    }

    async fn query(&self, args: &[String], operation: &str) -> Result<CommandOutput, RuntimeCommandError> {
        run_cmd_with_timeout(&self.program, args, QUERY_TIMEOUT, operation)
            .await
            .map_err(|e| Self::runner_error(operation, e))
    }

    async fn mutate(
        &self,
        args: &[String],
        operation: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeCommandError> {
        run_cmd_once(&self.program, args, timeout, operation)
            .await
            .map_err(|e| Self::runner_error(operation, e))
    }

    /// `docker --version` followed by `docker info`: the CLI is installed and the daemon answers.
    pub async fn preflight(&self) -> Result<DockerVersion, RuntimeCommandError> {
        let out = self.query(&["--version".to_string()], "docker_version").await?;
        if !out.success() {
            return Err(classify_failure("docker_version", "docker", &out));
        }
        let version = parse_docker_version(&out.stdout).ok_or_else(|| RuntimeCommandError::Failed {
            operation: "docker_version".to_string(),
            exit_code: out.exit_code,
            raw: format!("Failed to parse docker version from: {}", out.stdout.trim()),
        })?;

        let info = self.query(&["info".to_string()], "docker_info").await?;
        if !info.success() {
            let err = classify_failure("docker_info", "docker", &info);
            if info.stderr.to_lowercase().contains("permission denied") {
                warn!(
                    "[PHASE: preflight] [STEP: docker] Docker daemon check failed due to permission denied"
                );
            }
            return Err(match err {
                RuntimeCommandError::Failed { raw, .. } => RuntimeCommandError::DaemonUnavailable { raw },
                other => other,
            });
        }

        info!(
            "[PHASE: preflight] [STEP: docker] Docker {}.{}.{} available",
            version.major, version.minor, version.patch
        );
        Ok(version)
    }
}

#[async_trait]
impl RuntimeClient for DockerCli {
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeCommandError> {
        info!("[PHASE: installation] [STEP: docker] Pulling image {}", reference);
        let args = vec!["pull".to_string(), reference.to_string()];
        let out = self.mutate(&args, "docker_pull", self.pull_timeout).await?;
        if out.success() {
            return Ok(());
        }
        warn!(
            "[PHASE: installation] [STEP: docker] docker pull failed: {}",
            out.stderr.trim()
        );
        Err(classify_failure("docker_pull", reference, &out))
    }

    async fn create_network(&self, name: &str) -> Result<(), RuntimeCommandError> {
        let args = vec!["network".to_string(), "create".to_string(), name.to_string()];
        let out = self.mutate(&args, "docker_network_create", self.command_timeout).await?;
        if out.success() {
            return Ok(());
        }
        Err(classify_failure("docker_network_create", name, &out))
    }

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeCommandError> {
        let args = vec![
            "network".to_string(),
            "ls".to_string(),
            "--format".to_string(),
            "{{.Name}}".to_string(),
        ];
        let out = self.query(&args, "docker_network_ls").await?;
        if !out.success() {
            return Err(classify_failure("docker_network_ls", name, &out));
        }
        Ok(names_contain(&out.stdout, name))
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeCommandError> {
        info!(
            "[PHASE: installation] [STEP: docker] Starting container {} ({})",
            spec.name, spec.image
        );
        let args = build_run_args(spec);
        let out = self.mutate(&args, "docker_run", self.command_timeout).await?;
        if out.success() {
            let id = out.stdout.lines().last().unwrap_or("").trim().to_string();
            return Ok(if id.is_empty() { spec.name.clone() } else { id });
        }

        warn!(
            "[PHASE: installation] [STEP: docker] docker run failed for {}: {}",
            spec.name,
            out.stderr.trim()
        );
        Err(match classify_failure("docker_run", &spec.name, &out) {
            RuntimeCommandError::PortInUse { port: 0, raw } => RuntimeCommandError::PortInUse {
                port: spec.ports.first().map(|(h, _)| *h).unwrap_or(0),
                raw,
            },
            other => other,
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeCommandError> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            id.to_string(),
        ];
        let out = self.query(&args, "docker_inspect").await?;
        if !out.success() {
            return Err(classify_failure("docker_inspect", id, &out));
        }
        Ok(parse_container_state(&out.stdout))
    }

    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeCommandError> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let out = self.query(&args, "docker_ps").await?;
        if !out.success() {
            return Err(classify_failure("docker_ps", name, &out));
        }
        Ok(names_contain(&out.stdout, name))
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeCommandError> {
        let args = vec![
            "volume".to_string(),
            "ls".to_string(),
            "--format".to_string(),
            "{{.Name}}".to_string(),
        ];
        let out = self.query(&args, "docker_volume_ls").await?;
        if !out.success() {
            return Err(classify_failure("docker_volume_ls", name, &out));
        }
        Ok(names_contain(&out.stdout, name))
    }

    async fn exec(
        &self,
        id: &str,
        env: &[(String, String)],
        command: &[String],
    ) -> Result<ExecOutput, RuntimeCommandError> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(id.to_string());
        args.extend(command.iter().cloned());

        let out = self.mutate(&args, "docker_exec", self.command_timeout).await?;
        // A non-zero exit from the command itself is the caller's business; daemon-side
        // failures are not.
        if !out.success() {
            let err = classify_failure("docker_exec", id, &out);
            if out.stderr.contains("Error response from daemon")
                || matches!(err, RuntimeCommandError::DaemonUnavailable { .. })
            {
                return Err(err);
            }
        }
        Ok(ExecOutput {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeCommandError> {
        let args = vec!["restart".to_string(), id.to_string()];
        let out = self.mutate(&args, "docker_restart", self.command_timeout).await?;
        if out.success() {
            return Ok(());
        }
        Err(classify_failure("docker_restart", id, &out))
    }

    async fn container_logs(&self, id: &str, tail: u32) -> Result<String, RuntimeCommandError> {
        let args = vec![
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            id.to_string(),
        ];
        let out = self.query(&args, "docker_logs").await?;
        if !out.success() {
            return Err(classify_failure("docker_logs", id, &out));
        }
        // Docker logs go to both stdout and stderr depending on the log stream
        Ok(format!("{}{}", out.stdout, out.stderr))
    }

    async fn stop_and_remove(&self, id: &str) -> Result<(), RuntimeCommandError> {
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        let out = self.mutate(&args, "docker_rm", self.command_timeout).await?;
        if out.success() {
            return Ok(());
        }
        Err(classify_failure("docker_rm", id, &out))
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeCommandError> {
        let args = vec!["network".to_string(), "rm".to_string(), name.to_string()];
        let out = self.mutate(&args, "docker_network_rm", self.command_timeout).await?;
        if out.success() {
            return Ok(());
        }
        Err(classify_failure("docker_network_rm", name, &out))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeCommandError> {
        let args = vec!["volume".to_string(), "rm".to_string(), name.to_string()];
        let out = self.mutate(&args, "docker_volume_rm", self.command_timeout).await?;
        if out.success() {
            return Ok(());
        }
        Err(classify_failure("docker_volume_rm", name, &out))
    }

    async fn status_report(&self) -> Result<RuntimeStatusReport, RuntimeCommandError> {
        let table = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();

        let containers = self
            .query(
                &table(&["ps", "-a", "--format", "table {{.Names}}\t{{.Image}}\t{{.Status}}\t{{.Ports}}"]),
                "docker_ps",
            )
            .await?;
        if !containers.success() {
            return Err(classify_failure("docker_ps", "containers", &containers));
        }
        let networks = self
            .query(&table(&["network", "ls"]), "docker_network_ls")
            .await?;
        if !networks.success() {
            return Err(classify_failure("docker_network_ls", "networks", &networks));
        }
        let volumes = self
            .query(&table(&["volume", "ls"]), "docker_volume_ls")
            .await?;
        if !volumes.success() {
            return Err(classify_failure("docker_volume_ls", "volumes", &volumes));
        }

        Ok(RuntimeStatusReport {
            containers: containers.stdout,
            networks: networks.stdout,
            volumes: volumes.stdout,
        })
    }
}
