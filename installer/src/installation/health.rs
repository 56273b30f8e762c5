// Readiness checks
//
// Two kinds of waiting happen during an install:
// - the MySQL container must answer `mysqladmin ping` before Jira is started against it
//   (exponential backoff, bounded attempts, overall deadline);
// - the Jira container must satisfy its profile's readiness signal (fixed poll interval,
//   overall deadline).
// Both stop early when the session is cancelled.

use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;

use crate::config::InstallSettings;
use crate::error::{InstallFailure, RuntimeCommandError};
use crate::installation::catalog::ReadinessSignal;
use crate::installation::runtime::{ContainerState, RuntimeClient};

const LOG_TAIL_LINES: u32 = 200;

/// What a readiness probe looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub container: String,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeObservation {
    pub ready: bool,
    /// Human-readable description of what was seen; reported on timeout.
    pub detail: String,
}

impl ProbeObservation {
    pub fn ready(detail: impl Into<String>) -> Self {
        Self {
            ready: true,
            detail: detail.into(),
        }
    }

    pub fn waiting(detail: impl Into<String>) -> Self {
        Self {
            ready: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, signal: &ReadinessSignal) -> ProbeObservation;
}

/// Default probe: runtime state and logs through the runtime client, HTTP through reqwest.
pub struct RuntimeProbe {
    runtime: Arc<dyn RuntimeClient>,
    http: reqwest::Client,
    host: String,
}

impl RuntimeProbe {
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            runtime,
            http,
            host: "localhost".to_string(),
        })
    }

    async fn container_state(&self, target: &ProbeTarget) -> Result<ContainerState, String> {
        self.runtime
            .inspect_container(&target.container)
            .await
            .map_err(|e| format!("inspect failed: {}", e))
    }

    async fn probe_http(&self, target: &ProbeTarget, path: &str, body_contains: &[String]) -> ProbeObservation {
        // A container that has stopped will never answer; say so instead of "connection refused".
        match self.container_state(target).await {
            Ok(state) if !state.is_running() => {
                return ProbeObservation::waiting(format!("container state is {:?}", state));
            }
            Err(e) => return ProbeObservation::waiting(e),
            Ok(_) => {}
        }

        let url = format!("http://{}:{}{}", self.host, target.host_port, path);
        let resp = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => return ProbeObservation::waiting(format!("GET {} failed: {}", url, e)),
        };
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        http_observation(&url, status.as_u16(), &body, body_contains)
    }

    async fn probe_logs(&self, target: &ProbeTarget, pattern: &str) -> ProbeObservation {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => return ProbeObservation::waiting(format!("invalid log pattern: {}", e)),
        };
        match self.runtime.container_logs(&target.container, LOG_TAIL_LINES).await {
            Ok(logs) if re.is_match(&logs) => ProbeObservation::ready(format!("log matched '{}'", pattern)),
            Ok(_) => ProbeObservation::waiting(format!("no log line matched '{}' yet", pattern)),
            Err(e) => ProbeObservation::waiting(format!("reading logs failed: {}", e)),
        }
    }
}

/// Decide readiness from an HTTP answer. Jira's `/status` says `{"state":"RUNNING"}` once up
/// and `FIRST_RUN` before the setup wizard has been completed.
pub fn http_observation(url: &str, status: u16, body: &str, body_contains: &[String]) -> ProbeObservation {
    if status != 200 {
        return ProbeObservation::waiting(format!("GET {} answered {}", url, status));
    }
    if body_contains.is_empty() || body_contains.iter().any(|needle| body.contains(needle.as_str())) {
        return ProbeObservation::ready(format!("GET {} answered 200", url));
    }
    let snippet: String = body.chars().take(120).collect();
    ProbeObservation::waiting(format!("GET {} answered 200 with body '{}'", url, snippet.trim()))
}

#[async_trait]
impl ReadinessProbe for RuntimeProbe {
    async fn probe(&self, target: &ProbeTarget, signal: &ReadinessSignal) -> ProbeObservation {
        match signal {
            ReadinessSignal::ContainerRunning => match self.container_state(target).await {
                Ok(state) if state.is_running() => ProbeObservation::ready("container running"),
                Ok(state) => ProbeObservation::waiting(format!("container state is {:?}", state)),
                Err(e) => ProbeObservation::waiting(e),
            },
            ReadinessSignal::Http { path, body_contains } => {
                self.probe_http(target, path, body_contains).await
            }
            ReadinessSignal::LogPattern { pattern } => self.probe_logs(target, pattern).await,
        }
    }
}

/// Poll `probe` every `poll` until ready or `deadline` has elapsed.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    target: &ProbeTarget,
    signal: &ReadinessSignal,
    deadline: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<ProbeObservation, InstallFailure> {
    let started = Instant::now();
    info!(
        "[PHASE: installation] [STEP: health] Waiting for {} (deadline={}s)",
        target.container,
        deadline.as_secs()
    );

    loop {
        let observation = probe.probe(target, signal).await;
        if observation.ready {
            info!(
                "[PHASE: installation] [STEP: health] {} ready after {}ms: {}",
                target.container,
                started.elapsed().as_millis(),
                observation.detail
            );
            return Ok(observation);
        }
        debug!(
            "[PHASE: installation] [STEP: health] {} not ready: {}",
            target.container, observation.detail
        );

        let elapsed = started.elapsed();
        if elapsed >= deadline {
            warn!(
                "[PHASE: installation] [STEP: health] {} not ready within {}ms",
                target.container,
                deadline.as_millis()
            );
            return Err(InstallFailure::HealthCheckTimeout {
                target: target.container.clone(),
                deadline_ms: deadline.as_millis(),
                last_observation: observation.detail,
            });
        }

        let nap = poll.min(deadline - elapsed);
        tokio::select! {
            _ = cancel.cancelled() => return Err(InstallFailure::Cancelled),
            _ = tokio::time::sleep(nap) => {}
        }
    }
}

/// Backoff policy for the database readiness wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseWaitPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: usize,
    pub deadline: Duration,
}

impl DatabaseWaitPolicy {
    pub fn from_settings(s: &InstallSettings) -> Self {
        Self {
            initial_backoff: Duration::from_millis(s.db_ready_initial_backoff_ms),
            max_backoff: Duration::from_millis(s.db_ready_max_backoff_ms),
            max_attempts: s.db_ready_max_attempts.max(1),
            deadline: Duration::from_secs(s.db_ready_deadline_secs),
        }
    }

    /// Delays between attempts: initial, 2x, 4x, ... capped at `max_backoff`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // tokio-retry's exponential strategy yields base^n * factor; base 2 doubles each step.
        let factor = (self.initial_backoff.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_backoff)
            .take(self.max_attempts.saturating_sub(1))
    }
}

enum PingError {
    NotReady(String),
    Fatal(RuntimeCommandError),
}

/// Ping run inside the database container. The root password comes from the container's own
/// `MYSQL_ROOT_PASSWORD`; it never appears on the host's `docker exec` command line.
pub const MYSQL_PING_SCRIPT: &str =
    r#"MYSQL_PWD="$MYSQL_ROOT_PASSWORD" exec mysqladmin ping -h 127.0.0.1 -uroot --silent"#;

/// `mysqladmin ping` inside the database container until it answers.
pub async fn wait_for_database(
    runtime: &dyn RuntimeClient,
    container: &str,
    policy: &DatabaseWaitPolicy,
    cancel: &CancellationToken,
) -> Result<(), InstallFailure> {
    let started = Instant::now();
    let last_observation = Arc::new(Mutex::new(String::from("no attempt completed")));
    let command: Vec<String> = vec!["sh".to_string(), "-c".to_string(), MYSQL_PING_SCRIPT.to_string()];

    info!(
        "[PHASE: installation] [STEP: database] Waiting for MySQL in {} (max_attempts={}, deadline={}s)",
        container,
        policy.max_attempts,
        policy.deadline.as_secs()
    );

    let attempt = || {
        let command = command.clone();
        let last = Arc::clone(&last_observation);
        async move {
            let outcome = match runtime.exec(container, &[], &command).await {
                Ok(out) if out.success() => Ok(()),
                Ok(out) => Err(PingError::NotReady(format!(
                    "mysqladmin ping exit_code={:?}: {}",
                    out.exit_code,
                    out.stderr.trim()
                ))),
                Err(e @ RuntimeCommandError::DaemonUnavailable { .. })
                | Err(e @ RuntimeCommandError::NotFound { .. }) => Err(PingError::Fatal(e)),
                Err(e) => Err(PingError::NotReady(e.to_string())),
            };
            if let Err(PingError::NotReady(detail)) = &outcome {
                if let Ok(mut guard) = last.lock() {
                    *guard = detail.clone();
                }
            }
            outcome
        }
    };

    let retry = RetryIf::spawn(policy.delays(), attempt, |e: &PingError| {
        matches!(e, PingError::NotReady(_))
    });

    let last = || {
        last_observation
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(InstallFailure::Cancelled),
        r = tokio::time::timeout(policy.deadline, retry) => r,
    };

    match result {
        Ok(Ok(())) => {
            info!(
                "[PHASE: installation] [STEP: database] MySQL in {} is ready after {}ms",
                container,
                started.elapsed().as_millis()
            );
            Ok(())
        }
        Ok(Err(PingError::Fatal(e))) => Err(InstallFailure::Runtime(e)),
        Ok(Err(PingError::NotReady(_))) | Err(_) => Err(InstallFailure::HealthCheckTimeout {
            target: container.to_string(),
            deadline_ms: policy.deadline.as_millis(),
            last_observation: last(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProbe, FakeRuntime};

    fn fast_policy(attempts: usize) -> DatabaseWaitPolicy {
        DatabaseWaitPolicy {
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(5),
            max_attempts: attempts,
            deadline: Duration::from_secs(5),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = DatabaseWaitPolicy {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3_000),
            max_attempts: 6,
            deadline: Duration::from_secs(60),
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn http_observation_rules() {
        let needles = vec!["RUNNING".to_string(), "FIRST_RUN".to_string()];
        assert!(http_observation("u", 200, r#"{"state":"RUNNING"}"#, &needles).ready);
        assert!(http_observation("u", 200, r#"{"state":"FIRST_RUN"}"#, &needles).ready);
        assert!(!http_observation("u", 200, r#"{"state":"STARTING"}"#, &needles).ready);
        assert!(!http_observation("u", 503, "", &needles).ready);
        assert!(http_observation("u", 200, "anything", &[]).ready);
    }

    #[tokio::test]
    async fn wait_until_ready_returns_once_probe_passes() {
        let probe = FakeProbe::ready_after(2);
        let target = ProbeTarget {
            container: "jira9.12.0".to_string(),
            host_port: 8081,
        };
        let obs = wait_until_ready(
            &probe,
            &target,
            &ReadinessSignal::ContainerRunning,
            Duration::from_secs(5),
            Duration::from_millis(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(obs.ready);
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test]
    async fn wait_until_ready_times_out_with_last_observation() {
        let probe = FakeProbe::never_ready();
        let target = ProbeTarget {
            container: "jira10.0.0".to_string(),
            host_port: 8080,
        };
        let err = wait_until_ready(
            &probe,
            &target,
            &ReadinessSignal::ContainerRunning,
            Duration::from_millis(40),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            InstallFailure::HealthCheckTimeout { target, deadline_ms, last_observation } => {
                assert_eq!(target, "jira10.0.0");
                assert_eq!(deadline_ms, 40);
                assert!(last_observation.contains("still starting"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn wait_until_ready_honours_cancellation() {
        let probe = FakeProbe::never_ready();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let target = ProbeTarget {
            container: "c".to_string(),
            host_port: 8080,
        };
        let err = wait_until_ready(
            &probe,
            &target,
            &ReadinessSignal::ContainerRunning,
            Duration::from_secs(30),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err, InstallFailure::Cancelled);
    }

    #[tokio::test]
    async fn database_wait_retries_until_ping_succeeds() {
        let runtime = FakeRuntime::new();
        runtime.set_ping_failures(3);
        wait_for_database(&runtime, "10.0.0_mysql", &fast_policy(10), &CancellationToken::new())
            .await
            .unwrap();

        let execs = runtime.exec_calls();
        assert_eq!(execs.len(), 4);
        // The password is read inside the container; nothing secret crosses the host.
        let (env, cmd) = &execs[0];
        assert!(env.is_empty());
        assert_eq!(cmd[..2], ["sh".to_string(), "-c".to_string()]);
        assert!(cmd[2].contains("\"$MYSQL_ROOT_PASSWORD\""));
        assert!(cmd[2].contains("mysqladmin ping"));
    }

    #[tokio::test]
    async fn database_wait_gives_up_after_max_attempts() {
        let runtime = FakeRuntime::new();
        runtime.set_ping_failures(100);
        let err = wait_for_database(&runtime, "10.0.0_mysql", &fast_policy(3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallFailure::HealthCheckTimeout { .. }));
        assert_eq!(runtime.exec_calls().len(), 3);
    }
}
