//! Version catalog: maps a requested Jira version to its install profile.
//!
//! Jira 8/9 ship with an embedded database and are published on 8081; Jira 10/11 need an
//! external MySQL container and are published on 8080.

use serde::Serialize;

use crate::error::ValidationError;
use crate::utils::version::Version;

pub const JIRA_IMAGE_REPOSITORY: &str = "atlassian/jira-software";
pub const DEFAULT_MYSQL_IMAGE: &str = "mysql:8.0";
pub const DEFAULT_MYSQL_PORT: u16 = 3306;
pub const JIRA_CONTAINER_PORT: u16 = 8080;

const UPM_UPLOAD_ARG: &str = "-Dupm.plugin.upload.enabled=true";
const UPM_SIGNATURE_ARG: &str = "-Datlassian.upm.signature.check.disabled=true";

/// How the orchestrator decides that a container is ready to serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ReadinessSignal {
    /// The runtime reports the container as running.
    ContainerRunning,
    /// `GET http://localhost:<host_port><path>` answers 200 and (if set) the body contains one of
    /// `body_contains`.
    Http {
        path: String,
        body_contains: Vec<String>,
    },
    /// A line in the container log matches.
    LogPattern { pattern: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallProfile {
    pub version: String,
    pub requires_external_database: bool,
    pub default_port: u16,
    pub base_image_reference: String,
    pub database_image_reference: Option<String>,
    pub default_container_name: String,
    /// Value written to `JVM_SUPPORT_RECOMMENDED_ARGS` in `setenv.sh`.
    pub jvm_support_args: String,
    pub readiness: ReadinessSignal,
}

impl InstallProfile {
    pub fn default_database_container(&self) -> String {
        format!("{}_mysql", self.version)
    }

    pub fn default_database_name(&self) -> String {
        format!("{}_db", self.version)
    }

    pub fn default_database_volume(&self) -> String {
        format!("{}_mysql_data", self.version)
    }
}

/// Look up the install profile for `version`. Unknown or unsupported versions are rejected.
pub fn lookup(version: &str) -> Result<InstallProfile, ValidationError> {
    let requested = version.trim();
    if requested.is_empty() {
        return Err(ValidationError::new(
            "Please enter a Jira version (e.g., 9.15.0, 10.0.0, 11.0.0).",
        ));
    }

    let parsed = Version::parse(requested)
        .map_err(|e| ValidationError::new(format!("Unrecognised Jira version: {}", e)))?;

    let (requires_external_database, default_port) = match parsed.major() {
        8 | 9 => (false, 8081),
        10 | 11 => (true, 8080),
        _ => {
            return Err(ValidationError::new(format!(
                "Unsupported Jira version '{}'. Only 8.x, 9.x, 10.x, and 11.x are supported.",
                requested
            )))
        }
    };

    let jvm_support_args = if parsed.major() >= 11 {
        format!("{} {}", UPM_UPLOAD_ARG, UPM_SIGNATURE_ARG)
    } else {
        UPM_UPLOAD_ARG.to_string()
    };

    Ok(InstallProfile {
        version: requested.to_string(),
        requires_external_database,
        default_port,
        base_image_reference: format!("{}:{}", JIRA_IMAGE_REPOSITORY, requested),
        database_image_reference: requires_external_database
            .then(|| DEFAULT_MYSQL_IMAGE.to_string()),
        default_container_name: format!("jira{}", requested),
        jvm_support_args,
        readiness: ReadinessSignal::Http {
            path: "/status".to_string(),
            body_contains: vec!["RUNNING".to_string(), "FIRST_RUN".to_string()],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jira_8_and_9_use_builtin_database() {
        for v in ["8.5.0", "9.15.2"] {
            let p = lookup(v).unwrap();
            assert!(!p.requires_external_database, "{}", v);
            assert_eq!(p.default_port, 8081);
            assert_eq!(p.database_image_reference, None);
            assert_eq!(p.base_image_reference, format!("atlassian/jira-software:{}", v));
            assert_eq!(p.default_container_name, format!("jira{}", v));
        }
    }

    #[test]
    fn jira_10_and_11_need_mysql() {
        let p = lookup("10.0.0").unwrap();
        assert!(p.requires_external_database);
        assert_eq!(p.default_port, 8080);
        assert_eq!(p.database_image_reference.as_deref(), Some("mysql:8.0"));
        assert_eq!(p.default_database_container(), "10.0.0_mysql");
        assert_eq!(p.default_database_name(), "10.0.0_db");
        assert_eq!(p.default_database_volume(), "10.0.0_mysql_data");
    }

    #[test]
    fn jira_11_disables_upm_signature_check() {
        assert_eq!(
            lookup("11.0.0").unwrap().jvm_support_args,
            "-Dupm.plugin.upload.enabled=true -Datlassian.upm.signature.check.disabled=true"
        );
        assert_eq!(
            lookup("10.3.1").unwrap().jvm_support_args,
            "-Dupm.plugin.upload.enabled=true"
        );
    }

    #[test]
    fn unsupported_versions_are_rejected() {
        assert!(lookup("").is_err());
        assert!(lookup("7.13.0").is_err());
        assert!(lookup("12.0.0").is_err());
        assert!(lookup("latest").is_err());
    }

    #[test]
    fn profile_readiness_is_status_endpoint() {
        match lookup("9.12.0").unwrap().readiness {
            ReadinessSignal::Http { path, body_contains } => {
                assert_eq!(path, "/status");
                assert!(body_contains.contains(&"RUNNING".to_string()));
            }
            other => panic!("unexpected readiness signal {:?}", other),
        }
    }
}
