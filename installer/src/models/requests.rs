// Request models (what the caller / UI hands to the core)

use serde::{Deserialize, Serialize};

/// How the Jira instance stores its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseMode {
    /// Embedded H2 database shipped in the Jira image (Jira 8/9).
    BuiltIn,
    /// Separate MySQL container on the same network (Jira 10/11).
    External,
}

/// Optional overrides for the MySQL container. Unset fields fall back to version-derived defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseOverrides {
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub root_password: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub volume_name: Option<String>,
}

impl DatabaseOverrides {
    pub fn is_empty(&self) -> bool {
        *self == DatabaseOverrides::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    /// Jira version, e.g. "9.15.0" or "10.0.0".
    pub version: String,
    /// Host port mapped to Jira's 8080.
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub network_name: Option<String>,
    /// When unset the profile decides.
    #[serde(default)]
    pub database_mode: Option<DatabaseMode>,
    #[serde(default)]
    pub database: DatabaseOverrides,
    /// MySQL Connector/J version (external database only).
    #[serde(default)]
    pub driver_version: Option<String>,
    /// Application readiness deadline; falls back to configuration.
    #[serde(default)]
    pub health_deadline_secs: Option<u64>,
}

impl InstallRequest {
    pub fn for_version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }
}
