use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "jira-installer";

/// Folder the running executable lives in (falls back to the working directory).
pub fn resolve_deployment_folder() -> Result<PathBuf> {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(dir) = exe_path.parent() {
            return Ok(dir.to_path_buf());
        }
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    Ok(cwd)
}

/// The live executable the update engine replaces.
pub fn resolve_current_exe() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to resolve the running executable")?;
    // Follow symlinks so the swap replaces the real file, not the link.
    Ok(exe.canonicalize().unwrap_or(exe))
}

/// Default location of the optional TOML configuration file.
pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
}

fn ensure_dir(dir: PathBuf, what: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {} folder: {:?}", what, dir))?;
    Ok(dir)
}

fn app_dir(base: Option<PathBuf>, sub: &str) -> Result<PathBuf> {
    let base = match base {
        Some(b) => b.join(APP_DIR),
        None => resolve_deployment_folder()?.join(format!(".{}", APP_DIR)),
    };
    Ok(base.join(sub))
}

/// Resolve log folder (absolute path). An explicit folder from settings wins.
pub fn resolve_log_folder(configured: Option<&Path>) -> Result<PathBuf> {
    let dir = match configured {
        Some(p) => p.to_path_buf(),
        None => app_dir(dirs::data_local_dir(), "logs")?,
    };
    ensure_dir(dir, "log")
}

/// Where the update session marker lives.
pub fn resolve_state_dir(configured: Option<&Path>) -> Result<PathBuf> {
    let dir = match configured {
        Some(p) => p.to_path_buf(),
        None => app_dir(dirs::data_local_dir(), "state")?,
    };
    ensure_dir(dir, "state")
}

/// Cache for downloaded JDBC drivers.
pub fn resolve_cache_dir(configured: Option<&Path>) -> Result<PathBuf> {
    let dir = match configured {
        Some(p) => p.to_path_buf(),
        None => app_dir(dirs::cache_dir(), "drivers")?,
    };
    ensure_dir(dir, "cache")
}

/// Staging area for downloaded update packages.
pub fn resolve_staging_dir(configured: Option<&Path>) -> Result<PathBuf> {
    let dir = match configured {
        Some(p) => p.to_path_buf(),
        None => std::env::temp_dir(),
    };
    ensure_dir(dir, "staging")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_folders_are_created() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path().join("a").join("logs");
        let resolved = resolve_log_folder(Some(&logs)).unwrap();
        assert_eq!(resolved, logs);
        assert!(logs.is_dir());

        let state = resolve_state_dir(Some(&tmp.path().join("state"))).unwrap();
        assert!(state.is_dir());
    }

    #[test]
    fn default_config_file_is_namespaced() {
        if let Some(p) = default_config_file() {
            assert!(p.ends_with("jira-installer/config.toml"));
        }
    }

    #[test]
    fn current_exe_resolves() {
        let exe = resolve_current_exe().unwrap();
        assert!(exe.is_absolute());
    }
}
