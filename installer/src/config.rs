// Layered settings
//
// Built-in defaults, then an optional TOML file, then `JIRA_INSTALLER__<SECTION>__<KEY>`
// environment variables.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "JIRA_INSTALLER";
pub const DEFAULT_UPDATE_ENDPOINT: &str =
    "https://api.github.com/repos/tugasky/Xray-Support-DockerJiraInstaller/releases/latest";
pub const DEFAULT_CONNECTOR_VERSION: &str = "9.4.0";
pub const DEFAULT_CONNECTOR_BASE_URL: &str = "https://dev.mysql.com/get/Downloads/Connector-J";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Program name (looked up on PATH) or absolute path.
    pub program: String,
    pub command_timeout_secs: u64,
    pub pull_timeout_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            command_timeout_secs: 120,
            pull_timeout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    pub network_name: String,
    pub app_health_deadline_secs: u64,
    pub app_health_poll_secs: u64,
    pub db_ready_deadline_secs: u64,
    pub db_ready_initial_backoff_ms: u64,
    pub db_ready_max_backoff_ms: u64,
    pub db_ready_max_attempts: usize,
    /// Teardown retries per resource during rollback.
    pub teardown_retries: u32,
    pub connector_version: String,
    pub connector_base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_cache_dir: Option<PathBuf>,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            network_name: "jira_network".to_string(),
            app_health_deadline_secs: 600,
            app_health_poll_secs: 5,
            db_ready_deadline_secs: 120,
            db_ready_initial_backoff_ms: 500,
            db_ready_max_backoff_ms: 8_000,
            db_ready_max_attempts: 12,
            teardown_retries: 1,
            connector_version: DEFAULT_CONNECTOR_VERSION.to_string(),
            connector_base_url: DEFAULT_CONNECTOR_BASE_URL.to_string(),
            driver_cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    pub endpoint: String,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub validation_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_UPDATE_ENDPOINT.to_string(),
            request_timeout_secs: 10,
            download_timeout_secs: 300,
            validation_timeout_secs: 15,
            staging_dir: None,
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    pub level: String,
    pub stdout: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: None,
            level: "info".to_string(),
            stdout: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub runtime: RuntimeSettings,
    pub install: InstallSettings,
    pub update: UpdateSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from defaults, the config file and the process environment.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true);
        Self::load_with(path, env)
    }

    pub(crate) fn load_with(path: Option<&Path>, env: Environment) -> Result<Self> {
        let defaults = Config::try_from(&Settings::default())
            .context("Failed to serialize default settings")?;

        let mut builder = Config::builder().add_source(defaults);
        match path {
            Some(p) => {
                builder = builder.add_source(File::from(p).format(FileFormat::Toml).required(true));
            }
            None => {
                if let Some(p) = crate::utils::path_resolver::default_config_file() {
                    builder =
                        builder.add_source(File::from(p).format(FileFormat::Toml).required(false));
                }
            }
        }

        let settings: Settings = builder
            .add_source(env)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        if self.runtime.command_timeout_secs == 0 || self.runtime.pull_timeout_secs == 0 {
            anyhow::bail!("runtime timeouts must be greater than zero");
        }
        if self.install.app_health_poll_secs == 0 {
            anyhow::bail!("install.app_health_poll_secs must be greater than zero");
        }
        if self.install.db_ready_max_attempts == 0 {
            anyhow::bail!("install.db_ready_max_attempts must be greater than zero");
        }
        crate::utils::validation::validate_resource_name("install.network_name", &self.install.network_name)?;
        Ok(())
    }

    /// Effective settings as TOML (for `jira-installer config`).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render settings as TOML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .source(Some(map))
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.runtime.program, "docker");
        assert_eq!(s.install.network_name, "jira_network");
        assert_eq!(s.install.connector_version, "9.4.0");
        assert_eq!(s.install.teardown_retries, 1);
        assert!(s.update.endpoint.ends_with("/releases/latest"));
    }

    #[test]
    fn file_then_environment_override() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[install]\nnetwork_name = \"file_net\"\napp_health_deadline_secs = 30\n\n[logging]\nstdout = true\n",
        )
        .unwrap();

        let s = Settings::load_with(
            Some(&path),
            env_from(&[("JIRA_INSTALLER__INSTALL__APP_HEALTH_DEADLINE_SECS", "45")]),
        )
        .unwrap();

        assert_eq!(s.install.network_name, "file_net");
        assert_eq!(s.install.app_health_deadline_secs, 45);
        assert!(s.logging.stdout);
        // Untouched keys keep their defaults.
        assert_eq!(s.runtime.command_timeout_secs, 120);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(Settings::load_with(Some(&missing), env_from(&[])).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[install]\nnetwork_name = \"bad name\"\n").unwrap();
        assert!(Settings::load_with(Some(&path), env_from(&[])).is_err());
    }

    #[test]
    fn renders_as_toml() {
        let text = Settings::default().to_toml().unwrap();
        assert!(text.contains("[install]"));
        assert!(text.contains("network_name = \"jira_network\""));
    }
}
