//! Remote update descriptor and the distribution endpoint client.
//!
//! Two document shapes are accepted:
//! - a GitHub "latest release" document (`tag_name` + `assets`), where the checksum comes from
//!   the asset's `digest` (`sha256:<hex>`) or from a companion `<asset>.sha256` asset;
//! - a direct `{ "version": ..., "url": ..., "sha256": ... }` document.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::UpdateSettings;
use crate::error::UpdateFailure;
use crate::utils::version::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDescriptor {
    pub version: Version,
    pub url: String,
    /// Lower-case hex SHA-256 of the package.
    pub checksum: String,
}

/// Where updates come from.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn fetch_latest(&self) -> Result<UpdateDescriptor, UpdateFailure>;

    /// Download the package to `dest`, returning the number of bytes written.
    async fn download(
        &self,
        descriptor: &UpdateDescriptor,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateFailure>;
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct DirectDescriptor {
    version: String,
    url: String,
    sha256: String,
}

/// Where the package checksum lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumSource {
    Inline(String),
    /// URL of a `<asset>.sha256` file.
    Companion(String),
}

/// Descriptor parsed from the endpoint, possibly still waiting for its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDescriptor {
    pub version: Version,
    pub url: String,
    pub checksum: ChecksumSource,
}

pub fn parse_descriptor(body: &str, os: &str) -> Result<ParsedDescriptor, UpdateFailure> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| UpdateFailure::Remote(format!("descriptor is not JSON: {}", e)))?;

    if value.get("tag_name").is_some() {
        let release: Release = serde_json::from_value(value)
            .map_err(|e| UpdateFailure::Remote(format!("malformed release document: {}", e)))?;
        return parse_release(release, os);
    }

    let direct: DirectDescriptor = serde_json::from_value(value)
        .map_err(|e| UpdateFailure::Remote(format!("malformed update descriptor: {}", e)))?;
    Ok(ParsedDescriptor {
        version: parse_version(&direct.version)?,
        url: parse_download_url(&direct.url)?,
        checksum: ChecksumSource::Inline(normalize_checksum(&direct.sha256)?),
    })
}

fn parse_release(release: Release, os: &str) -> Result<ParsedDescriptor, UpdateFailure> {
    let version = parse_version(&release.tag_name)?;
    let names: Vec<&str> = release.assets.iter().map(|a| a.name.as_str()).collect();
    let idx = select_asset(&names, os).ok_or_else(|| {
        UpdateFailure::Remote(format!(
            "release {} has no installer package for {}",
            release.tag_name, os
        ))
    })?;
    let asset = &release.assets[idx];

    let checksum = match asset.digest.as_deref().and_then(|d| d.strip_prefix("sha256:")) {
        Some(hex) => ChecksumSource::Inline(normalize_checksum(hex)?),
        None => {
            let companion = format!("{}.sha256", asset.name);
            let sidecar = release
                .assets
                .iter()
                .find(|a| a.name.eq_ignore_ascii_case(&companion))
                .ok_or_else(|| {
                    UpdateFailure::Remote(format!(
                        "release {} publishes no checksum for {}",
                        release.tag_name, asset.name
                    ))
                })?;
            ChecksumSource::Companion(parse_download_url(&sidecar.browser_download_url)?)
        }
    };

    Ok(ParsedDescriptor {
        version,
        url: parse_download_url(&asset.browser_download_url)?,
        checksum,
    })
}

/// Only absolute http(s) URLs are fetched.
fn parse_download_url(raw: &str) -> Result<String, UpdateFailure> {
    let url = url::Url::parse(raw.trim())
        .map_err(|e| UpdateFailure::Remote(format!("invalid download URL {:?}: {}", raw, e)))?;
    match url.scheme() {
        "https" | "http" => Ok(url.to_string()),
        other => Err(UpdateFailure::Remote(format!(
            "unsupported download URL scheme '{}' in {:?}",
            other, raw
        ))),
    }
}

fn parse_version(raw: &str) -> Result<Version, UpdateFailure> {
    Version::parse(raw).map_err(|e| UpdateFailure::Remote(e.to_string()))
}

/// Pick the installer package among release assets.
///
/// Checksum files are never packages. An asset naming the platform wins; otherwise `.exe` on
/// Windows and any `jira-installer`/`jira_installer` asset elsewhere.
pub fn select_asset(names: &[&str], os: &str) -> Option<usize> {
    let candidates: Vec<(usize, String)> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (i, n.to_ascii_lowercase()))
        .filter(|(_, n)| !n.ends_with(".sha256"))
        .collect();

    let is_installer = |n: &str| n.contains("jira-installer") || n.contains("jira_installer");
    let fits_platform = |n: &str| {
        if os == "windows" {
            n.ends_with(".exe")
        } else {
            !n.ends_with(".exe")
        }
    };

    candidates
        .iter()
        .find(|(_, n)| n.contains(os) && fits_platform(n))
        .or_else(|| {
            candidates
                .iter()
                .find(|(_, n)| is_installer(n) && fits_platform(n))
        })
        .map(|(i, _)| *i)
}

/// Accept `<hex>` or `<hex>  <file name>` (sha256sum output).
pub fn normalize_checksum(raw: &str) -> Result<String, UpdateFailure> {
    let hex = raw.split_whitespace().next().unwrap_or("").to_ascii_lowercase();
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UpdateFailure::Remote(format!(
            "'{}' is not a SHA-256 checksum",
            raw.trim()
        )));
    }
    Ok(hex)
}

/// Update source backed by an HTTPS endpoint (GitHub releases by default).
pub struct HttpUpdateSource {
    endpoint: String,
    http: reqwest::Client,
    download_timeout: Duration,
}

impl HttpUpdateSource {
    pub fn new(settings: &UpdateSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: settings.endpoint.clone(),
            http,
            download_timeout: Duration::from_secs(settings.download_timeout_secs),
        })
    }

    async fn get_text(&self, url: &str, what: &str) -> Result<String, UpdateFailure> {
        let resp = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json, application/json")
            .send()
            .await
            .map_err(|e| UpdateFailure::Remote(format!("{} request failed: {}", what, e)))?;
        if !resp.status().is_success() {
            return Err(UpdateFailure::Remote(format!(
                "{} request returned HTTP {}",
                what,
                resp.status()
            )));
        }
        resp.text()
            .await
            .map_err(|e| UpdateFailure::Remote(format!("{} body unreadable: {}", what, e)))
    }

    async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateFailure> {
        let mut resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateFailure::Download(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(UpdateFailure::Download(format!("HTTP {} for {}", resp.status(), url)));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| UpdateFailure::Download(format!("create {:?} failed: {}", dest, e)))?;
        let mut total: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(UpdateFailure::Cancelled),
                c = resp.chunk() => c.map_err(|e| UpdateFailure::Download(e.to_string()))?,
            };
            let Some(bytes) = chunk else { break };
            file.write_all(&bytes)
                .await
                .map_err(|e| UpdateFailure::Download(format!("write {:?} failed: {}", dest, e)))?;
            total = total.saturating_add(bytes.len() as u64);
        }
        file.flush()
            .await
            .map_err(|e| UpdateFailure::Download(format!("flush {:?} failed: {}", dest, e)))?;
        Ok(total)
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn fetch_latest(&self) -> Result<UpdateDescriptor, UpdateFailure> {
        debug!(
            "[PHASE: update] [STEP: check] fetching descriptor (endpoint={})",
            self.endpoint
        );
        let body = self.get_text(&self.endpoint, "descriptor").await?;
        let parsed = parse_descriptor(&body, std::env::consts::OS)?;

        let checksum = match parsed.checksum {
            ChecksumSource::Inline(hex) => hex,
            ChecksumSource::Companion(url) => {
                let text = self.get_text(&url, "checksum").await?;
                normalize_checksum(&text)?
            }
        };

        info!(
            "[PHASE: update] [STEP: check] remote version {} (url={})",
            parsed.version, parsed.url
        );
        Ok(UpdateDescriptor {
            version: parsed.version,
            url: parsed.url,
            checksum,
        })
    }

    async fn download(
        &self,
        descriptor: &UpdateDescriptor,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateFailure> {
        let started = Instant::now();
        info!(
            "[PHASE: update] [STEP: download] downloading {} to {:?}",
            descriptor.url, dest
        );
        match tokio::time::timeout(
            self.download_timeout,
            self.stream_to_file(&descriptor.url, dest, cancel),
        )
        .await
        {
            Ok(Ok(n)) => {
                info!(
                    "[PHASE: update] [STEP: download] downloaded {} bytes in {}ms",
                    n,
                    started.elapsed().as_millis()
                );
                Ok(n)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "[PHASE: update] [STEP: download] timed out after {}s",
                    self.download_timeout.as_secs()
                );
                Err(UpdateFailure::Download(format!(
                    "timed out after {}s",
                    self.download_timeout.as_secs()
                )))
            }
        }
    }
}
