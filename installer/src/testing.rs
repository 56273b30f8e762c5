// In-memory fakes for unit tests.
//
// The fake runtime behaves like a tiny docker: names are unique, removing something that does
// not exist is NotFound, named volumes appear when a container mounts them and cannot be removed
// while a container still mounts them. Failures are
// injected per (operation, subject). The update fakes serve packages from memory and validate
// executables by their contents.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{InstallFailure, RuntimeCommandError, UpdateFailure};
use crate::installation::catalog::ReadinessSignal;
use crate::installation::driver::{jar_file_name, DriverArtifact, DriverProvider};
use crate::installation::health::{ProbeObservation, ProbeTarget, ReadinessProbe};
use crate::installation::runtime::{
    ContainerSpec, ContainerState, ExecOutput, RuntimeClient, RuntimeStatusReport,
};
use crate::update::descriptor::{UpdateDescriptor, UpdateSource};
use crate::update::validate::{self_check_line, ExecutableValidator};
use crate::utils::version::Version;

#[derive(Default)]
struct RuntimeState {
    containers: BTreeSet<String>,
    networks: BTreeSet<String>,
    volumes: BTreeSet<String>,
    /// container name -> named volumes it mounts
    mounts: HashMap<String, Vec<String>>,
    calls: Vec<String>,
    exec_calls: Vec<(Vec<(String, String)>, Vec<String>)>,
    run_specs: Vec<ContainerSpec>,
    failures: HashMap<String, (RuntimeCommandError, usize)>,
    ping_failures: usize,
    failed_run_leaves_container: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut RuntimeState) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    pub fn with_container(self, name: &str) -> Self {
        self.with(|s| s.containers.insert(name.to_string()));
        self
    }

    pub fn with_network(self, name: &str) -> Self {
        self.with(|s| s.networks.insert(name.to_string()));
        self
    }

    pub fn with_volume(self, name: &str) -> Self {
        self.with(|s| s.volumes.insert(name.to_string()));
        self
    }

    /// Fail `op` on `subject` the next `times` calls.
    pub fn fail(&self, op: &str, subject: &str, err: RuntimeCommandError, times: usize) {
        self.with(|s| {
            s.failures.insert(format!("{}:{}", op, subject), (err, times));
        });
    }

    pub fn fail_always(&self, op: &str, subject: &str, err: RuntimeCommandError) {
        self.fail(op, subject, err, usize::MAX);
    }

    pub fn set_ping_failures(&self, n: usize) {
        self.with(|s| s.ping_failures = n);
    }

    /// Simulate docker creating the container before failing (e.g. port bind errors).
    pub fn set_failed_run_leaves_container(&self, leaves: bool) {
        self.with(|s| s.failed_run_leaves_container = leaves);
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn mutating_calls(&self) -> Vec<String> {
        const QUERIES: [&str; 6] = [
            "network_exists",
            "container_exists",
            "volume_exists",
            "inspect_container",
            "container_logs",
            "status_report",
        ];
        self.calls()
            .into_iter()
            .filter(|c| !QUERIES.iter().any(|q| c.starts_with(q)))
            .collect()
    }

    pub fn exec_calls(&self) -> Vec<(Vec<(String, String)>, Vec<String>)> {
        self.with(|s| s.exec_calls.clone())
    }

    pub fn run_specs(&self) -> Vec<ContainerSpec> {
        self.with(|s| s.run_specs.clone())
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.with(|s| s.containers.contains(name))
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.with(|s| s.networks.contains(name))
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.with(|s| s.volumes.contains(name))
    }

    pub fn teardown_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("stop_and_remove") || c.starts_with("remove_"))
            .collect()
    }

    fn enter(&self, op: &str, subject: &str) -> Result<(), RuntimeCommandError> {
        self.with(|s| {
            s.calls.push(format!("{} {}", op, subject));
            let key = format!("{}:{}", op, subject);
            if let Some((err, remaining)) = s.failures.get_mut(&key) {
                if *remaining > 0 {
                    if *remaining != usize::MAX {
                        *remaining -= 1;
                    }
                    return Err(err.clone());
                }
            }
            Ok(())
        })
    }
}

fn named_volumes(spec: &ContainerSpec) -> Vec<String> {
    spec.mounts
        .iter()
        .map(|(source, _)| source.clone())
        .filter(|source| !source.contains('/'))
        .collect()
}

impl RuntimeState {
    fn create(&mut self, spec: &ContainerSpec) {
        self.containers.insert(spec.name.clone());
        let volumes = named_volumes(spec);
        self.volumes.extend(volumes.iter().cloned());
        self.mounts.insert(spec.name.clone(), volumes);
    }
}

fn not_found(what: &str) -> RuntimeCommandError {
    RuntimeCommandError::NotFound {
        what: what.to_string(),
        raw: format!("Error: No such object: {}", what),
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeCommandError> {
        self.enter("pull_image", reference)
    }

    async fn create_network(&self, name: &str) -> Result<(), RuntimeCommandError> {
        self.enter("create_network", name)?;
        self.with(|s| {
            if !s.networks.insert(name.to_string()) {
                return Err(RuntimeCommandError::NameInUse {
                    name: name.to_string(),
                    raw: format!("network with name {} already exists", name),
                });
            }
            Ok(())
        })
    }

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeCommandError> {
        self.enter("network_exists", name)?;
        Ok(self.has_network(name))
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeCommandError> {
        self.with(|s| s.run_specs.push(spec.clone()));
        if let Err(e) = self.enter("run_container", &spec.name) {
            self.with(|s| {
                if s.failed_run_leaves_container {
                    s.create(spec);
                }
            });
            return Err(e);
        }
        self.with(|s| {
            if s.containers.contains(&spec.name) {
                return Err(RuntimeCommandError::NameInUse {
                    name: spec.name.clone(),
                    raw: format!(
                        "Conflict. The container name \"/{}\" is already in use by container \"0ddba11\"",
                        spec.name
                    ),
                });
            }
            s.create(spec);
            Ok(format!("id-{}", spec.name))
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeCommandError> {
        self.enter("inspect_container", id)?;
        let name = id.trim_start_matches("id-");
        if self.has_container(name) {
            Ok(ContainerState::Running)
        } else {
            Err(not_found(id))
        }
    }

    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeCommandError> {
        self.enter("container_exists", name)?;
        Ok(self.has_container(name))
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeCommandError> {
        self.enter("volume_exists", name)?;
        Ok(self.has_volume(name))
    }

    async fn exec(
        &self,
        id: &str,
        env: &[(String, String)],
        command: &[String],
    ) -> Result<ExecOutput, RuntimeCommandError> {
        self.enter("exec", id)?;
        let is_ping = command.iter().any(|a| a.contains("mysqladmin ping"));
        self.with(|s| {
            s.exec_calls.push((env.to_vec(), command.to_vec()));
            if is_ping && s.ping_failures > 0 {
                s.ping_failures -= 1;
                return Ok(ExecOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "mysqladmin: connect to server at '127.0.0.1' failed".to_string(),
                });
            }
            Ok(ExecOutput {
                exit_code: Some(0),
                stdout: if is_ping { "mysqld is alive".to_string() } else { String::new() },
                stderr: String::new(),
            })
        })
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeCommandError> {
        self.enter("restart_container", id)
    }

    async fn container_logs(&self, id: &str, _tail: u32) -> Result<String, RuntimeCommandError> {
        self.enter("container_logs", id)?;
        Ok(String::new())
    }

    async fn stop_and_remove(&self, id: &str) -> Result<(), RuntimeCommandError> {
        self.enter("stop_and_remove", id)?;
        self.with(|s| {
            let name = id.trim_start_matches("id-");
            if s.containers.remove(name) {
                s.mounts.remove(name);
                Ok(())
            } else {
                Err(not_found(id))
            }
        })
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeCommandError> {
        self.enter("remove_network", name)?;
        self.with(|s| {
            if s.networks.remove(name) {
                Ok(())
            } else {
                Err(not_found(name))
            }
        })
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeCommandError> {
        self.enter("remove_volume", name)?;
        self.with(|s| {
            if let Some((owner, _)) = s.mounts.iter().find(|(_, v)| v.iter().any(|v| v == name)) {
                return Err(RuntimeCommandError::Failed {
                    operation: "docker_volume_rm".to_string(),
                    exit_code: Some(1),
                    raw: format!(
                        "Error response from daemon: remove {}: volume is in use - [{}]",
                        name, owner
                    ),
                });
            }
            if s.volumes.remove(name) {
                Ok(())
            } else {
                Err(not_found(name))
            }
        })
    }

    async fn status_report(&self) -> Result<RuntimeStatusReport, RuntimeCommandError> {
        self.enter("status_report", "")?;
        Ok(self.with(|s| RuntimeStatusReport {
            containers: s.containers.iter().cloned().collect::<Vec<_>>().join("\n"),
            networks: s.networks.iter().cloned().collect::<Vec<_>>().join("\n"),
            volumes: s.volumes.iter().cloned().collect::<Vec<_>>().join("\n"),
        }))
    }
}

/// Readiness probe that turns ready after a fixed number of negative answers.
pub struct FakeProbe {
    not_ready_for: usize,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn ready_after(not_ready_for: usize) -> Self {
        Self {
            not_ready_for,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn never_ready() -> Self {
        Self::ready_after(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn probe(&self, _target: &ProbeTarget, _signal: &ReadinessSignal) -> ProbeObservation {
        let seen = self.calls.fetch_add(1, Ordering::SeqCst);
        if seen >= self.not_ready_for {
            ProbeObservation::ready("status RUNNING")
        } else {
            ProbeObservation::waiting("status endpoint says still starting")
        }
    }
}

/// Driver provider that never touches the network.
#[derive(Default)]
pub struct FakeDrivers {
    pub fail_with: Option<String>,
    requested: Mutex<Vec<String>>,
}

impl FakeDrivers {
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl DriverProvider for FakeDrivers {
    async fn provide(&self, version: &str) -> Result<DriverArtifact, InstallFailure> {
        self.requested.lock().unwrap().push(version.to_string());
        if let Some(reason) = &self.fail_with {
            return Err(InstallFailure::Driver(reason.clone()));
        }
        let file_name = jar_file_name(version);
        Ok(DriverArtifact {
            jar_path: PathBuf::from("/cache").join(&file_name),
            file_name,
        })
    }
}

/// Update source serving one package from memory.
pub struct FakeUpdateSource {
    descriptor: UpdateDescriptor,
    payload: Vec<u8>,
    fail_download: Option<String>,
    downloads: AtomicUsize,
}

impl FakeUpdateSource {
    pub fn serving(version: &str, payload: &[u8]) -> Self {
        let checksum = Sha256::digest(payload)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Self {
            descriptor: UpdateDescriptor {
                version: Version::parse(version).unwrap(),
                url: format!("https://updates.invalid/jira-installer-{}", version),
                checksum,
            },
            payload: payload.to_vec(),
            fail_download: None,
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn with_checksum(mut self, checksum: &str) -> Self {
        self.descriptor.checksum = checksum.to_string();
        self
    }

    pub fn failing_download(mut self, reason: &str) -> Self {
        self.fail_download = Some(reason.to_string());
        self
    }

    pub fn descriptor(&self) -> UpdateDescriptor {
        self.descriptor.clone()
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateSource for FakeUpdateSource {
    async fn fetch_latest(&self) -> Result<UpdateDescriptor, UpdateFailure> {
        Ok(self.descriptor.clone())
    }

    async fn download(
        &self,
        _descriptor: &UpdateDescriptor,
        dest: &Path,
        _cancel: &CancellationToken,
    ) -> Result<u64, UpdateFailure> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_download {
            return Err(UpdateFailure::Download(reason.clone()));
        }
        tokio::fs::write(dest, &self.payload)
            .await
            .map_err(|e| UpdateFailure::Download(e.to_string()))?;
        Ok(self.payload.len() as u64)
    }
}

/// Validator that "runs" an executable by reading it: the file must contain exactly the
/// self-check line for the expected version.
pub struct FakeValidator {
    reject_all: bool,
}

impl FakeValidator {
    pub fn by_content() -> Self {
        Self { reject_all: false }
    }

    pub fn rejecting_all() -> Self {
        Self { reject_all: true }
    }
}

#[async_trait]
impl ExecutableValidator for FakeValidator {
    async fn validate(&self, exe: &Path, expected: &Version) -> Result<(), String> {
        if self.reject_all {
            return Err("self-check exited with Some(1)".to_string());
        }
        let contents = tokio::fs::read_to_string(exe)
            .await
            .map_err(|e| e.to_string())?;
        if contents.trim() == self_check_line(expected) {
            Ok(())
        } else {
            Err(format!("unexpected self-check output {:?}", contents.trim()))
        }
    }
}
