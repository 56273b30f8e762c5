// Executable self-check
//
// A candidate executable is runnable when `<exe> --self-check` exits 0 within the timeout and
// prints `jira-installer <version>` with the expected version.

use async_trait::async_trait;
use log::{info, warn};
use std::path::Path;
use std::time::Duration;

use crate::installation::run_cmd_once;
use crate::utils::version::Version;

pub const SELF_CHECK_ARG: &str = "--self-check";
pub const SELF_CHECK_PREFIX: &str = "jira-installer";

#[async_trait]
pub trait ExecutableValidator: Send + Sync {
    /// `Err` carries a human-readable reason.
    async fn validate(&self, exe: &Path, expected: &Version) -> Result<(), String>;
}

/// The line `--self-check` prints for `version`.
pub fn self_check_line(version: &Version) -> String {
    format!("{} {}", SELF_CHECK_PREFIX, version)
}

/// Version reported by a self-check run, if any line looks like one.
pub fn parse_self_check(stdout: &str) -> Option<Version> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(SELF_CHECK_PREFIX)?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        Version::parse(rest.trim()).ok()
    })
}

pub struct SelfCheckValidator {
    timeout: Duration,
}

impl SelfCheckValidator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ExecutableValidator for SelfCheckValidator {
    async fn validate(&self, exe: &Path, expected: &Version) -> Result<(), String> {
        let args = vec![SELF_CHECK_ARG.to_string()];
        let out = run_cmd_once(exe.as_os_str(), &args, self.timeout, "self_check")
            .await
            .map_err(|e| format!("{:#}", e))?;

        if !out.success() {
            warn!(
                "[PHASE: update] [STEP: validate] self-check of {:?} exited with {:?}: {}",
                exe,
                out.exit_code,
                out.stderr.trim()
            );
            return Err(format!(
                "self-check exited with {:?}: {}",
                out.exit_code,
                out.stderr.trim()
            ));
        }

        match parse_self_check(&out.stdout) {
            Some(v) if v == *expected => {
                info!(
                    "[PHASE: update] [STEP: validate] {:?} reports {} as expected ({}ms)",
                    exe, v, out.duration_ms
                );
                Ok(())
            }
            Some(v) => Err(format!("executable reports version {}, expected {}", v, expected)),
            None => Err(format!(
                "self-check printed no version line: {:?}",
                out.stdout.trim()
            )),
        }
    }
}
