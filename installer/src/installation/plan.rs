// Install plan
//
// Resolves an `InstallRequest` against its version profile and the configured defaults, and
// validates every field. Building a plan has no side effects; the orchestrator only touches
// the runtime once this succeeds.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::InstallSettings;
use crate::error::ValidationError;
use crate::installation::catalog::{self, InstallProfile, DEFAULT_MYSQL_PORT, JIRA_CONTAINER_PORT};
use crate::installation::driver::DriverArtifact;
use crate::installation::runtime::ContainerSpec;
use crate::models::requests::{DatabaseMode, InstallRequest};
use crate::utils::validation::{
    validate_image_reference, validate_mysql_identifier, validate_port, validate_resource_name,
    validate_secret,
};

const DEFAULT_DB_ROOT_PASSWORD: &str = "root_password";
const DEFAULT_DB_USER: &str = "jira_user";
const DEFAULT_DB_PASSWORD: &str = "jira_password";
const MYSQL_DATA_DIR: &str = "/var/lib/mysql";
const SETENV_PATH: &str = "/opt/atlassian/jira/bin/setenv.sh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabasePlan {
    pub container_name: String,
    pub image: String,
    pub database_name: String,
    pub user: String,
    pub password: String,
    pub root_password: String,
    /// Port Jira uses to reach MySQL on the container network.
    pub port: u16,
    pub volume_name: String,
}

impl DatabasePlan {
    pub fn jdbc_url(&self) -> String {
        format!(
            "jdbc:mysql://{}:{}/{}?useSSL=false&serverTimezone=UTC",
            self.container_name, self.port, self.database_name
        )
    }

    pub fn container_spec(&self, network: &str) -> ContainerSpec {
        let mut env = BTreeMap::new();
        env.insert("MYSQL_ROOT_PASSWORD".to_string(), self.root_password.clone());
        env.insert("MYSQL_DATABASE".to_string(), self.database_name.clone());
        env.insert("MYSQL_USER".to_string(), self.user.clone());
        env.insert("MYSQL_PASSWORD".to_string(), self.password.clone());
        if self.port != DEFAULT_MYSQL_PORT {
            env.insert("MYSQL_TCP_PORT".to_string(), self.port.to_string());
        }
        ContainerSpec {
            name: self.container_name.clone(),
            image: self.image.clone(),
            network: network.to_string(),
            ports: Vec::new(),
            env,
            mounts: vec![(self.volume_name.clone(), MYSQL_DATA_DIR.to_string())],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub profile: InstallProfile,
    pub container_name: String,
    pub network_name: String,
    pub host_port: u16,
    pub database: Option<DatabasePlan>,
    /// Connector/J version, set for external-database installs.
    pub driver_version: Option<String>,
    pub health_deadline: Duration,
    pub health_poll: Duration,
}

impl InstallPlan {
    pub fn build(request: &InstallRequest, settings: &InstallSettings) -> Result<Self, ValidationError> {
        let profile = catalog::lookup(&request.version)?;

        let host_port = match request.port {
            Some(p) => validate_port("Jira port", p)?,
            None => profile.default_port,
        };

        let container_name = non_empty(&request.container_name)
            .unwrap_or_else(|| profile.default_container_name.clone());
        validate_resource_name("Jira container name", &container_name)?;

        let network_name =
            non_empty(&request.network_name).unwrap_or_else(|| settings.network_name.clone());
        validate_resource_name("network name", &network_name)?;

        match (request.database_mode, profile.requires_external_database) {
            (Some(DatabaseMode::BuiltIn), true) => {
                return Err(ValidationError::new(format!(
                    "Jira {} requires an external database; built-in mode is not supported",
                    profile.version
                )))
            }
            (Some(DatabaseMode::External), false) => {
                return Err(ValidationError::new(format!(
                    "Jira {} uses its built-in database; external database mode is not supported",
                    profile.version
                )))
            }
            _ => {}
        }

        let (database, driver_version) = if profile.requires_external_database {
            let db = Self::database_plan(request, &profile)?;
            let driver = non_empty(&request.driver_version)
                .unwrap_or_else(|| settings.connector_version.clone());
            validate_driver_version(&driver)?;
            (Some(db), Some(driver))
        } else {
            if !request.database.is_empty() {
                return Err(ValidationError::new(format!(
                    "Database settings were given but Jira {} uses its built-in database",
                    profile.version
                )));
            }
            if request.driver_version.is_some() {
                return Err(ValidationError::new(format!(
                    "A JDBC driver version was given but Jira {} uses its built-in database",
                    profile.version
                )));
            }
            (None, None)
        };

        if let Some(db) = &database {
            if db.container_name == container_name {
                return Err(ValidationError::new(
                    "Database container name must differ from the Jira container name",
                ));
            }
        }

        let deadline_secs = request
            .health_deadline_secs
            .unwrap_or(settings.app_health_deadline_secs);
        if deadline_secs == 0 {
            return Err(ValidationError::new("Health deadline must be greater than zero"));
        }

        Ok(Self {
            profile,
            container_name,
            network_name,
            host_port,
            database,
            driver_version,
            health_deadline: Duration::from_secs(deadline_secs),
            health_poll: Duration::from_secs(settings.app_health_poll_secs.max(1)),
        })
    }

    fn database_plan(request: &InstallRequest, profile: &InstallProfile) -> Result<DatabasePlan, ValidationError> {
        let o = &request.database;

        let container_name =
            non_empty(&o.container_name).unwrap_or_else(|| profile.default_database_container());
        validate_resource_name("database container name", &container_name)?;

        let volume_name =
            non_empty(&o.volume_name).unwrap_or_else(|| profile.default_database_volume());
        validate_resource_name("database volume name", &volume_name)?;

        let database_name =
            non_empty(&o.database_name).unwrap_or_else(|| profile.default_database_name());
        validate_mysql_identifier("database name", &database_name)?;

        let user = non_empty(&o.user).unwrap_or_else(|| DEFAULT_DB_USER.to_string());
        validate_mysql_identifier("database user", &user)?;
        if user.eq_ignore_ascii_case("root") {
            return Err(ValidationError::new(
                "database user cannot be 'root'; MySQL creates the root account itself",
            ));
        }

        let password = o
            .password
            .clone()
            .unwrap_or_else(|| DEFAULT_DB_PASSWORD.to_string());
        validate_secret("database password", &password)?;

        let root_password = o
            .root_password
            .clone()
            .unwrap_or_else(|| DEFAULT_DB_ROOT_PASSWORD.to_string());
        validate_secret("database root password", &root_password)?;

        let image = match non_empty(&o.image) {
            Some(i) => i,
            None => profile
                .database_image_reference
                .clone()
                .unwrap_or_else(|| catalog::DEFAULT_MYSQL_IMAGE.to_string()),
        };
        validate_image_reference("database image", &image)?;

        let port = match o.port {
            Some(p) => validate_port("database port", p)?,
            None => DEFAULT_MYSQL_PORT,
        };

        Ok(DatabasePlan {
            container_name,
            image,
            database_name,
            user,
            password,
            root_password,
            port,
            volume_name,
        })
    }

    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.host_port)
    }

    /// `docker run` spec for the Jira container. External-database installs carry the JDBC
    /// settings and the driver mount.
    pub fn application_spec(&self, driver: Option<&DriverArtifact>) -> ContainerSpec {
        let mut env = BTreeMap::new();
        let mut mounts = Vec::new();
        if let Some(db) = &self.database {
            env.insert("ATL_JDBC_URL".to_string(), db.jdbc_url());
            env.insert("ATL_JDBC_USER".to_string(), db.user.clone());
            env.insert("ATL_JDBC_PASSWORD".to_string(), db.password.clone());
        }
        if let Some(d) = driver {
            mounts.push((d.jar_path.to_string_lossy().to_string(), d.mount_target()));
        }
        ContainerSpec {
            name: self.container_name.clone(),
            image: self.profile.base_image_reference.clone(),
            network: self.network_name.clone(),
            ports: vec![(self.host_port, JIRA_CONTAINER_PORT)],
            env,
            mounts,
        }
    }

    /// Shell command that rewrites `JVM_SUPPORT_RECOMMENDED_ARGS` in Jira's `setenv.sh`.
    pub fn jvm_patch_command(&self) -> Vec<String> {
        let sed = format!(
            r##"sed -i "s#^\(:\s*\${{JVM_SUPPORT_RECOMMENDED_ARGS[^}}]*}}\|JVM_SUPPORT_RECOMMENDED_ARGS=.*\)#JVM_SUPPORT_RECOMMENDED_ARGS=\"{}\"#" {}"##,
            self.profile.jvm_support_args, SETENV_PATH
        );
        vec!["bash".to_string(), "-c".to_string(), sed]
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn validate_driver_version(version: &str) -> Result<(), ValidationError> {
    let ok = !version.is_empty()
        && version.split('.').all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !ok {
        return Err(ValidationError::new(format!(
            "JDBC driver version '{}' must look like 9.4.0",
            version
        )));
    }
    Ok(())
}
