// Persisted update session marker
//
// `update-session.json` in the state directory records where an update session stands from
// `BackingUp` onwards, so a later launch can finish or repair it. Writes go through a temp file
// and a rename; a reader never sees half a marker.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::state::UpdateState;
use crate::update::files::remove_if_exists;

pub const MARKER_FILE: &str = "update-session.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMarker {
    pub session_id: String,
    pub state: UpdateState,
    pub previous_version: String,
    pub target_version: String,
    pub live_path: PathBuf,
    pub backup_path: PathBuf,
    pub staged_path: PathBuf,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    path: PathBuf,
}

impl MarkerStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(MARKER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, marker: &UpdateMarker) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create state dir failed: {:?}", parent))?;
        }
        let json = serde_json::to_vec_pretty(marker)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("write marker failed: {:?}", tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename marker failed: {:?}", self.path))?;
        Ok(())
    }

    /// `None` when no session is pending.
    pub async fn load(&self) -> Result<Option<UpdateMarker>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("read marker failed: {:?}", self.path))
            }
        };
        let marker = serde_json::from_slice(&bytes)
            .with_context(|| format!("marker is corrupt: {:?}", self.path))?;
        Ok(Some(marker))
    }

    pub async fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path).await
    }
}
