// Installation logic
//
// This module contains the Jira install orchestrator, its container-runtime client, and the
// shared utilities for running external commands with timeouts/retries.
//
// IMPORTANT:
// - Never log secrets (database passwords, tokens).
// - All I/O should be async.

pub mod catalog;
pub mod docker;
pub mod driver;
pub mod health;
pub mod orchestrator;
pub mod plan;
pub mod runtime;
pub mod session;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub(crate) fn mask_arg_for_log(arg: &str) -> String {
    // `-e KEY=VALUE` style arguments: mask by key.
    let masked = crate::utils::logging::mask_env_assignment(arg);
    if masked != arg {
        return masked;
    }

    // URLs with embedded credentials (user:pass@host).
    if arg.contains("://") && arg.contains('@') {
        return crate::utils::logging::mask_url_credentials(arg);
    }

    arg.to_string()
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("busy")
        || msg.contains("resource")
        || msg.contains("i/o")
        || msg.contains("io error")
}

/// Run an external command once with a timeout.
///
/// Returns captured stdout/stderr even when exit code is non-zero (caller decides success).
/// Mutating runtime commands go through this so a timed-out `docker run` is never repeated.
pub async fn run_cmd_once<S: AsRef<OsStr>>(
    program: S,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let program = program.as_ref();
    let program_label = program.to_string_lossy().to_string();
    let started = Instant::now();

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd_once entered (operation={}, program={}, args=[{}], timeout_ms={})",
        operation,
        program_label,
        args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>().join(", "),
        timeout_dur.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            program_label, operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!(
                    "Command wait failed (operation={}, program={})",
                    operation, program_label
                )
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: installation] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); attempting to kill process",
                operation,
                program_label,
                timeout_dur.as_millis()
            );

            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: installation] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, program_label, e
                );
            }

            // Best-effort reap (avoid zombies)
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(anyhow::anyhow!(
                "Command timed out after {}ms (operation={}, program={})",
                timeout_dur.as_millis(),
                operation,
                program_label
            ));
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd_once exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        program_label,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

/// Run an external command with a timeout and up to 3 retries for transient failures.
///
/// Only for idempotent queries (`inspect`, `ls`, `--version`). Returns captured stdout/stderr
/// even when exit code is non-zero (caller decides success).
pub async fn run_cmd_with_timeout<S: AsRef<OsStr>>(
    program: S,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();
    let program_owned = program.as_ref().to_os_string();
    let program_label = program_owned.to_string_lossy().to_string();
    info!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout entered (operation={}, program={}, args_count={}, timeout_ms={})",
        operation,
        program_label,
        args.len(),
        timeout_dur.as_millis()
    );

    let args_owned = args.to_vec();
    let operation_owned = operation.to_string();

    let attempt = move || {
        let program = program_owned.clone();
        let args = args_owned.clone();
        let op = operation_owned.clone();
        async move { run_cmd_once(&program, &args, timeout_dur, &op).await }
    };

    let retry_strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| {
        let transient = is_transient_exec_error(e);
        if transient {
            warn!(
                "[PHASE: installation] [STEP: cmd] Transient command failure detected; will retry (operation={}, program={}, err={})",
                operation,
                program_label,
                e
            );
        }
        transient
    })
    .await;

    match &result {
        Ok(out) => {
            info!(
                "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout exit (operation={}, exit_code={:?}, duration_ms={})",
                operation,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout error (operation={}, duration_ms={}, err={:?})",
                operation,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}
