//! File helpers for the self-update.
//!
//! - Async I/O only (tokio)
//! - Retry transient lock errors (AV scanners and indexers on Windows)
//! - Copies are hashed while they are written, so callers can verify without a second read
//! - Replacement of the live executable is a rename, never delete-then-copy

use anyhow::{Context, Result};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// `<path><suffix>` next to `path`, e.g. `jira-installer.backup`.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn is_transient_fs_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    msg.contains("used by another process")
        || msg.contains("being used")
        || msg.contains("resource busy")
        || msg.contains("text file busy")
        || msg.contains("temporarily")
        || msg.contains("timed out")
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 of a file's contents, lower-case hex.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open failed: {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

/// Copy one file with retries and a size-scaled timeout, returning `(bytes_written, sha256_hex)`.
///
/// The hash is over the bytes copied. Caller must create the parent directory.
pub async fn copy_file_with_retries_and_sha256(
    src: &Path,
    dst: &Path,
    label: &str,
) -> Result<(u64, String)> {
    let started = Instant::now();
    debug!(
        "[PHASE: update] [STEP: files] copy entered (label={}, src={:?}, dst={:?})",
        label, src, dst
    );

    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=3u32 {
        let timeout_dur = match tokio::fs::metadata(src).await {
            // 60s plus 1s per MiB, capped at 10 minutes.
            Ok(m) => Duration::from_secs(60_u64.saturating_add(m.len() / (1024 * 1024)).min(600)),
            Err(_) => Duration::from_secs(60),
        };

        match timeout(timeout_dur, copy_file_once_and_sha256(src, dst)).await {
            Ok(Ok((n, sha))) => {
                debug!(
                    "[PHASE: update] [STEP: files] copy ok (label={}, bytes={}, sha256={}, attempt={}, duration_ms={})",
                    label,
                    n,
                    sha,
                    attempt,
                    started.elapsed().as_millis()
                );
                return Ok((n, sha));
            }
            Ok(Err(e)) => {
                let transient = is_transient_fs_error(&e);
                warn!(
                    "[PHASE: update] [STEP: files] copy failed (label={}, attempt={}, transient={}, src={:?}, dst={:?}, err={:#})",
                    label, attempt, transient, src, dst, e
                );
                last_err = Some(e);
                if !transient {
                    break;
                }
            }
            Err(_) => {
                warn!(
                    "[PHASE: update] [STEP: files] copy timeout (label={}, attempt={}, timeout_ms={})",
                    label,
                    attempt,
                    timeout_dur.as_millis()
                );
                last_err = Some(anyhow::anyhow!(
                    "copy timed out (timeout_ms={})",
                    timeout_dur.as_millis()
                ));
            }
        }

        tokio::time::sleep(Duration::from_millis(200_u64 << (attempt - 1))).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("copy failed")))
}

async fn copy_file_once_and_sha256(src: &Path, dst: &Path) -> Result<(u64, String)> {
    let mut src_f = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("open src failed: {:?}", src))?;
    let mut dst_f = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("create dst failed: {:?}", dst))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = src_f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        dst_f.write_all(&buf[..n]).await?;
        total = total.saturating_add(n as u64);
    }
    dst_f.flush().await?;
    dst_f.sync_all().await?;
    drop(dst_f);

    copy_permissions(src, dst).await;
    Ok((total, to_hex(&hasher.finalize())))
}

/// Best-effort: give `dst` the permission bits of `src`.
pub async fn copy_permissions(src: &Path, dst: &Path) {
    if let Ok(meta) = tokio::fs::metadata(src).await {
        if let Err(e) = tokio::fs::set_permissions(dst, meta.permissions()).await {
            warn!(
                "[PHASE: update] [STEP: files] could not copy permissions {:?} -> {:?}: {}",
                src, dst, e
            );
        }
    }
}

/// Move `replacement` over `live` without a window where `live` is missing.
///
/// Unix renames over the existing file. Windows cannot rename over a running executable, so the
/// live file is renamed aside (`<live>.old`) first and put back if the second rename fails.
pub async fn replace_atomically(replacement: &Path, live: &Path) -> Result<()> {
    #[cfg(windows)]
    {
        let aside = sibling(live, ".old");
        if tokio::fs::try_exists(&aside).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&aside).await;
        }
        tokio::fs::rename(live, &aside)
            .await
            .with_context(|| format!("rename {:?} -> {:?} failed", live, aside))?;
        if let Err(e) = tokio::fs::rename(replacement, live).await {
            let _ = tokio::fs::rename(&aside, live).await;
            return Err(anyhow::Error::new(e))
                .with_context(|| format!("rename {:?} -> {:?} failed", replacement, live));
        }
        Ok(())
    }

    #[cfg(not(windows))]
    {
        tokio::fs::rename(replacement, live)
            .await
            .with_context(|| format!("rename {:?} -> {:?} failed", replacement, live))
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e)).with_context(|| format!("remove {:?} failed", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_appends_to_file_name() {
        assert_eq!(
            sibling(Path::new("/opt/ji/jira-installer"), ".backup"),
            PathBuf::from("/opt/ji/jira-installer.backup")
        );
        assert_eq!(
            sibling(Path::new("C:/Tools/jira-installer.exe"), ".new"),
            PathBuf::from("C:/Tools/jira-installer.exe.new")
        );
    }

    #[tokio::test]
    async fn copy_hash_matches_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        tokio::fs::write(&src, b"test").await.unwrap();

        let (n, sha) = copy_file_with_retries_and_sha256(&src, &dst, "test").await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(
            sha,
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
        assert_eq!(sha256_file(&dst).await.unwrap(), sha);
    }

    #[tokio::test]
    async fn missing_source_fails_without_retrying_forever() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_file_with_retries_and_sha256(
            &dir.path().join("nope"),
            &dir.path().join("dst"),
            "test",
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", err).contains("open src failed"));
    }

    #[tokio::test]
    async fn replace_swaps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live");
        let new = dir.path().join("live.new");
        tokio::fs::write(&live, b"old").await.unwrap();
        tokio::fs::write(&new, b"new").await.unwrap();

        replace_atomically(&new, &live).await.unwrap();
        assert_eq!(tokio::fs::read(&live).await.unwrap(), b"new");
        assert!(!new.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copy_keeps_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("exe");
        let dst = dir.path().join("exe.copy");
        std::fs::write(&src, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o755)).unwrap();

        copy_file_with_retries_and_sha256(&src, &dst, "test").await.unwrap();
        let mode = std::fs::metadata(&dst).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn remove_if_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("x");
        tokio::fs::write(&p, b"x").await.unwrap();
        remove_if_exists(&p).await.unwrap();
        remove_if_exists(&p).await.unwrap();
    }
}
