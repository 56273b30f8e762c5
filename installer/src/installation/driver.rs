//! MySQL Connector/J provisioning.
//!
//! Jira images do not bundle the MySQL JDBC driver. For external-database installs the jar is
//! downloaded once into a cache directory and bind-mounted into the application container.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use log::{debug, info};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tar::Archive;

use crate::error::InstallFailure;

/// Where Jira picks up extra JDBC drivers.
pub const JIRA_LIB_DIR: &str = "/opt/atlassian/jira/lib";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverArtifact {
    /// Host path of the jar.
    pub jar_path: PathBuf,
    pub file_name: String,
}

impl DriverArtifact {
    pub fn mount_target(&self) -> String {
        format!("{}/{}", JIRA_LIB_DIR, self.file_name)
    }
}

#[async_trait]
pub trait DriverProvider: Send + Sync {
    async fn provide(&self, version: &str) -> Result<DriverArtifact, InstallFailure>;
}

pub fn jar_file_name(version: &str) -> String {
    format!("mysql-connector-j-{}.jar", version)
}

pub struct MysqlConnectorProvider {
    cache_dir: PathBuf,
    base_url: String,
    http: reqwest::Client,
}

impl MysqlConnectorProvider {
    pub fn new(cache_dir: PathBuf, base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(crate::USER_AGENT)
            .build()?;
        Ok(Self {
            cache_dir,
            base_url: base_url.into(),
            http,
        })
    }

    fn archive_url(&self, version: &str) -> String {
        format!(
            "{}/mysql-connector-j-{}.tar.gz",
            self.base_url.trim_end_matches('/'),
            version
        )
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, InstallFailure> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| InstallFailure::Driver(format!("GET {} failed: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(InstallFailure::Driver(format!(
                "GET {} answered {}",
                url,
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| InstallFailure::Driver(format!("reading {} failed: {}", url, e)))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl DriverProvider for MysqlConnectorProvider {
    async fn provide(&self, version: &str) -> Result<DriverArtifact, InstallFailure> {
        let file_name = jar_file_name(version);
        let jar_path = self.cache_dir.join(&file_name);

        if let Ok(meta) = tokio::fs::metadata(&jar_path).await {
            if meta.is_file() && meta.len() > 0 {
                debug!(
                    "[PHASE: installation] [STEP: driver] Using cached driver {:?}",
                    jar_path
                );
                return Ok(DriverArtifact { jar_path, file_name });
            }
        }

        tokio::fs::create_dir_all(&self.cache_dir).await.map_err(|e| {
            InstallFailure::Driver(format!("cannot create cache dir {:?}: {}", self.cache_dir, e))
        })?;

        let url = self.archive_url(version);
        info!("[PHASE: installation] [STEP: driver] Downloading {}", url);
        let archive = self.download(&url).await?;

        let dest = jar_path.clone();
        let name = file_name.clone();
        tokio::task::spawn_blocking(move || extract_jar(&archive, &name, &dest))
            .await
            .map_err(|e| InstallFailure::Driver(format!("extraction task failed: {}", e)))??;

        info!(
            "[PHASE: installation] [STEP: driver] Driver ready at {:?}",
            jar_path
        );
        Ok(DriverArtifact { jar_path, file_name })
    }
}

/// Archive entries must stay relative and inside the archive root.
pub fn is_safe_entry_path(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Pull `jar_name` out of a Connector/J `.tar.gz` and write it to `dest` (via a temp file so a
/// half-written jar is never mounted).
pub fn extract_jar(archive_bytes: &[u8], jar_name: &str, dest: &Path) -> Result<(), InstallFailure> {
    let fail = |reason: String| InstallFailure::Driver(reason);
    let mut archive = Archive::new(GzDecoder::new(archive_bytes));

    let entries = archive
        .entries()
        .map_err(|e| fail(format!("unreadable archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| fail(format!("unreadable archive entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| fail(format!("bad entry path: {}", e)))?
            .into_owned();

        if !is_safe_entry_path(&path) {
            return Err(fail(format!(
                "archive entry escapes extraction root: {}",
                path.display()
            )));
        }
        if path.file_name().and_then(|n| n.to_str()) != Some(jar_name) {
            continue;
        }

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| fail(format!("reading {} failed: {}", jar_name, e)))?;
        if data.is_empty() {
            return Err(fail(format!("{} in archive is empty", jar_name)));
        }

        let tmp = dest.with_extension("jar.tmp");
        std::fs::write(&tmp, &data).map_err(|e| fail(format!("writing {:?} failed: {}", tmp, e)))?;
        std::fs::rename(&tmp, dest)
            .map_err(|e| fail(format!("moving driver into {:?} failed: {}", dest, e)))?;
        return Ok(());
    }

    Err(fail(format!("{} not found in archive", jar_name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let enc = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn extracts_jar_from_connector_archive() {
        let archive = tar_gz(&[
            ("mysql-connector-j-9.4.0/README", b"readme"),
            ("mysql-connector-j-9.4.0/mysql-connector-j-9.4.0.jar", b"PK\x03\x04jar-bytes"),
        ]);
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("mysql-connector-j-9.4.0.jar");
        extract_jar(&archive, "mysql-connector-j-9.4.0.jar", &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"PK\x03\x04jar-bytes");
    }

    #[test]
    fn missing_jar_is_reported() {
        let archive = tar_gz(&[("mysql-connector-j-9.4.0/README", b"readme")]);
        let tmp = tempfile::tempdir().unwrap();
        let err = extract_jar(&archive, "mysql-connector-j-9.4.0.jar", &tmp.path().join("x.jar"))
            .unwrap_err();
        assert!(matches!(err, InstallFailure::Driver(m) if m.contains("not found")));
    }

    #[test]
    fn traversal_paths_are_unsafe() {
        assert!(is_safe_entry_path(Path::new("a/b/c.jar")));
        assert!(is_safe_entry_path(Path::new("./a.jar")));
        assert!(!is_safe_entry_path(Path::new("../evil.jar")));
        assert!(!is_safe_entry_path(Path::new("a/../../evil.jar")));
        assert!(!is_safe_entry_path(Path::new("/etc/passwd")));
    }

    #[test]
    fn mount_target_is_in_jira_lib() {
        let a = DriverArtifact {
            jar_path: PathBuf::from("/cache/mysql-connector-j-9.4.0.jar"),
            file_name: jar_file_name("9.4.0"),
        };
        assert_eq!(a.mount_target(), "/opt/atlassian/jira/lib/mysql-connector-j-9.4.0.jar");
    }

    #[tokio::test]
    async fn cached_jar_is_reused_without_download() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("mysql-connector-j-8.4.0.jar"), b"cached").unwrap();
        // Unroutable base URL: any network access would fail the test.
        let provider = MysqlConnectorProvider::new(
            tmp.path().to_path_buf(),
            "http://127.0.0.1:9",
            Duration::from_millis(200),
        )
        .unwrap();
        let artifact = provider.provide("8.4.0").await.unwrap();
        assert_eq!(artifact.jar_path, tmp.path().join("mysql-connector-j-8.4.0.jar"));
    }

    #[test]
    fn archive_url_shape() {
        let provider = MysqlConnectorProvider::new(
            PathBuf::from("/tmp"),
            "https://dev.mysql.com/get/Downloads/Connector-J/",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            provider.archive_url("9.4.0"),
            "https://dev.mysql.com/get/Downloads/Connector-J/mysql-connector-j-9.4.0.tar.gz"
        );
    }
}
