//! Self-update engine.
//!
//! `CheckingRemote → Downloading → Verifying → BackingUp → Swapping → PostSwapValidating →
//! Completed`. Failures before `BackingUp` (and a backup that cannot be verified) leave the
//! system unchanged. Later failures restore the backup over the live executable and re-validate
//! it; if that fails too, the backup and staged package stay on disk for an operator.
//!
//! The marker file is written before the backup is taken and again before the swap, so a crash at
//! any point after that is visible to `recover()` on the next launch.

use chrono::Utc;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::UpdateFailure;
use crate::events::{EventKind, EventLevel, EventSink, ProgressEvent};
use crate::models::responses::{UpdateOutcome, UpdateReport};
use crate::models::state::UpdateState;
use crate::update::descriptor::{UpdateDescriptor, UpdateSource};
use crate::update::files::{
    copy_file_with_retries_and_sha256, copy_permissions, remove_if_exists, replace_atomically,
    sha256_file, sibling,
};
use crate::update::marker::{MarkerStore, UpdateMarker};
use crate::update::validate::ExecutableValidator;
use crate::utils::version::Version;

pub const BACKUP_SUFFIX: &str = ".backup";

/// Filesystem locations an update session works with.
#[derive(Debug, Clone)]
pub struct UpdatePaths {
    /// The installed executable being replaced.
    pub live_exe: PathBuf,
    pub staging_dir: PathBuf,
    pub state_dir: PathBuf,
}

#[derive(Debug)]
struct UpdateSession {
    id: String,
    state: UpdateState,
    target: Version,
    checksum: String,
    staged_path: PathBuf,
    backup_path: PathBuf,
    staged_created: bool,
    backup_created: bool,
    marker_written: bool,
}

pub struct UpdateEngine {
    source: Arc<dyn UpdateSource>,
    validator: Arc<dyn ExecutableValidator>,
    paths: UpdatePaths,
    markers: MarkerStore,
    current: Version,
    sink: EventSink,
}

impl UpdateEngine {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        validator: Arc<dyn ExecutableValidator>,
        paths: UpdatePaths,
        current: Version,
        sink: EventSink,
    ) -> Self {
        let markers = MarkerStore::new(&paths.state_dir);
        Self {
            source,
            validator,
            paths,
            markers,
            current,
            sink,
        }
    }

    pub fn current_version(&self) -> &Version {
        &self.current
    }

    /// The remote descriptor when it is newer than the running version.
    pub async fn check_for_update(&self) -> Result<Option<UpdateDescriptor>, UpdateFailure> {
        let remote = self.source.fetch_latest().await?;
        if remote.version > self.current {
            info!(
                "[PHASE: update] [STEP: check] update available: {} -> {}",
                self.current, remote.version
            );
            Ok(Some(remote))
        } else {
            info!(
                "[PHASE: update] [STEP: check] up to date (running={}, remote={})",
                self.current, remote.version
            );
            Ok(None)
        }
    }

    pub async fn apply_update(&self, descriptor: &UpdateDescriptor, cancel: CancellationToken) -> UpdateReport {
        let started = Instant::now();
        let mut session = UpdateSession {
            id: uuid::Uuid::new_v4().to_string(),
            state: UpdateState::Idle,
            target: descriptor.version.clone(),
            checksum: descriptor.checksum.to_ascii_lowercase(),
            staged_path: self.paths.staging_dir.join(format!(
                "jira-installer-{}.tmp",
                descriptor.version
            )),
            backup_path: sibling(&self.paths.live_exe, BACKUP_SUFFIX),
            staged_created: false,
            backup_created: false,
            marker_written: false,
        };
        info!(
            "[PHASE: update] [STEP: session] apply_update entered (session={}, running={}, target={}, live={:?})",
            session.id, self.current, descriptor.version, self.paths.live_exe
        );

        let report = match self.download_and_verify(&mut session, descriptor, &cancel).await {
            Err(reason) => self.abandon(session, reason).await,
            Ok(()) => match self.back_up(&mut session).await {
                Err(reason) => self.abandon(session, reason).await,
                Ok(()) => match self.swap_and_validate(&mut session, &cancel).await {
                    Ok(()) => self.complete(session).await,
                    Err(reason) => self.restore(session, reason).await,
                },
            },
        };

        info!(
            "[PHASE: update] [STEP: session] apply_update exit (session={}, final_state={}, duration_ms={})",
            report.session_id,
            report.final_state,
            started.elapsed().as_millis()
        );
        report
    }

    async fn download_and_verify(
        &self,
        session: &mut UpdateSession,
        descriptor: &UpdateDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateFailure> {
        self.enter(
            session,
            UpdateState::CheckingRemote,
            format!("Running {}, offered {}", self.current, descriptor.version),
        );
        match self.markers.load().await {
            Ok(None) => {}
            Ok(Some(pending)) => return Err(UpdateFailure::Interrupted(pending.state)),
            Err(e) => {
                warn!("[PHASE: update] [STEP: check] pending update marker unreadable: {:#}", e);
                return Err(UpdateFailure::Interrupted(UpdateState::Failed));
            }
        }
        if descriptor.version <= self.current {
            return Err(UpdateFailure::Remote(format!(
                "offered version {} is not newer than running version {}",
                descriptor.version, self.current
            )));
        }

        self.enter(session, UpdateState::Downloading, format!("Downloading {}", descriptor.url));
        ensure_not_cancelled(cancel)?;
        tokio::fs::create_dir_all(&self.paths.staging_dir)
            .await
            .map_err(|e| {
                UpdateFailure::Download(format!(
                    "create staging dir {:?} failed: {}",
                    self.paths.staging_dir, e
                ))
            })?;
        session.staged_created = true;
        let bytes = self
            .source
            .download(descriptor, &session.staged_path, cancel)
            .await?;

        self.enter(
            session,
            UpdateState::Verifying,
            format!("Verifying SHA-256 of {} bytes", bytes),
        );
        ensure_not_cancelled(cancel)?;
        let actual = sha256_file(&session.staged_path)
            .await
            .map_err(|e| UpdateFailure::Download(format!("{:#}", e)))?;
        if actual != session.checksum {
            return Err(UpdateFailure::ChecksumMismatch {
                expected: session.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    async fn back_up(&self, session: &mut UpdateSession) -> Result<(), UpdateFailure> {
        self.enter(
            session,
            UpdateState::BackingUp,
            format!("Backing up {:?}", self.paths.live_exe),
        );
        self.persist(session)
            .await
            .map_err(|e| UpdateFailure::BackupFailed(format!("could not persist update marker: {:#}", e)))?;
        session.marker_written = true;

        session.backup_created = true;
        let live = &self.paths.live_exe;
        let (bytes, sha) = copy_file_with_retries_and_sha256(live, &session.backup_path, "backup")
            .await
            .map_err(|e| UpdateFailure::BackupFailed(format!("{:#}", e)))?;
        verify_backup(live, &session.backup_path, bytes, &sha)
            .await
            .map_err(UpdateFailure::BackupFailed)?;
        info!(
            "[PHASE: update] [STEP: backup] verified backup {:?} ({} bytes, sha256={})",
            session.backup_path, bytes, sha
        );
        Ok(())
    }

    async fn swap_and_validate(
        &self,
        session: &mut UpdateSession,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateFailure> {
        self.enter(
            session,
            UpdateState::Swapping,
            format!("Replacing {:?}", self.paths.live_exe),
        );
        ensure_not_cancelled(cancel)?;
        self.persist(session)
            .await
            .map_err(|e| UpdateFailure::SwapFailed(format!("could not persist update marker: {:#}", e)))?;

        let new_path = sibling(&self.paths.live_exe, ".new");
        if let Err(e) = self.swap_in(session, &new_path).await {
            let _ = remove_if_exists(&new_path).await;
            return Err(e);
        }

        self.enter(
            session,
            UpdateState::PostSwapValidating,
            format!("Running self-check of {}", session.target),
        );
        self.persist_best_effort(session).await;
        ensure_not_cancelled(cancel)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UpdateFailure::Cancelled),
            result = self.validator.validate(&self.paths.live_exe, &session.target) => {
                result.map_err(UpdateFailure::PostSwapValidationFailed)
            }
        }
    }

    async fn swap_in(&self, session: &UpdateSession, new_path: &Path) -> Result<(), UpdateFailure> {
        let live = &self.paths.live_exe;
        let (_, sha) = copy_file_with_retries_and_sha256(&session.staged_path, new_path, "stage")
            .await
            .map_err(|e| UpdateFailure::SwapFailed(format!("{:#}", e)))?;
        if sha != session.checksum {
            return Err(UpdateFailure::SwapFailed(format!(
                "staged package changed after verification (sha256={})",
                sha
            )));
        }
        copy_permissions(live, new_path).await;
        replace_atomically(new_path, live)
            .await
            .map_err(|e| UpdateFailure::SwapFailed(format!("{:#}", e)))
    }

    async fn complete(&self, mut session: UpdateSession) -> UpdateReport {
        self.cleanup(&session.staged_path, &session.backup_path).await;
        let version = session.target.to_string();
        self.enter(
            &mut session,
            UpdateState::Completed,
            format!("Updated to {}; restart to use it", version),
        );
        UpdateReport {
            session_id: session.id,
            final_state: UpdateState::Completed,
            outcome: UpdateOutcome::Success { version },
        }
    }

    /// Failure before anything live changed.
    async fn abandon(&self, mut session: UpdateSession, reason: UpdateFailure) -> UpdateReport {
        let stage = session.state;
        if session.staged_created {
            self.remove_quietly(&session.staged_path).await;
        }
        if session.backup_created {
            self.remove_quietly(&session.backup_path).await;
        }
        if session.marker_written {
            if let Err(e) = self.markers.clear().await {
                warn!("[PHASE: update] [STEP: cleanup] could not clear marker: {:#}", e);
            }
        }
        session.state = UpdateState::Failed;
        self.state_event(
            &session.id,
            UpdateState::Failed,
            EventLevel::Error,
            format!("Update failed during {} (nothing changed): {}", stage, reason),
        );
        UpdateReport {
            session_id: session.id,
            final_state: UpdateState::Failed,
            outcome: UpdateOutcome::NoChange { stage, reason },
        }
    }

    async fn restore(&self, mut session: UpdateSession, reason: UpdateFailure) -> UpdateReport {
        let stage = session.state;
        warn!(
            "[PHASE: update] [STEP: restore] {} failed: {}; restoring {:?}",
            stage, reason, session.backup_path
        );
        self.enter(
            &mut session,
            UpdateState::RestoringBackup,
            format!("{} failed ({}); restoring the previous version", stage, reason),
        );
        self.persist_best_effort(&session).await;

        match self
            .restore_from_backup(&self.paths.live_exe, &session.backup_path, &self.current)
            .await
        {
            Ok(()) => {
                self.cleanup(&session.staged_path, &session.backup_path).await;
                self.enter(
                    &mut session,
                    UpdateState::Restored,
                    format!("Version {} restored and verified", self.current),
                );
                UpdateReport {
                    session_id: session.id,
                    final_state: UpdateState::Restored,
                    outcome: UpdateOutcome::Restored { stage, reason },
                }
            }
            Err(restore_error) => {
                session.state = UpdateState::Failed;
                self.persist_best_effort(&session).await;
                self.manual_intervention(
                    &session.id,
                    format!("{} (after {} failed: {})", restore_error, stage, reason),
                    session.backup_path.clone(),
                    session.staged_path.clone(),
                )
            }
        }
    }

    fn manual_intervention(
        &self,
        session_id: &str,
        reason: String,
        backup_path: PathBuf,
        staged_path: PathBuf,
    ) -> UpdateReport {
        self.state_event(
            session_id,
            UpdateState::Failed,
            EventLevel::Error,
            format!(
                "Restore failed: {}. Manual recovery: copy {:?} over {:?} (staged package: {:?})",
                reason, backup_path, self.paths.live_exe, staged_path
            ),
        );
        UpdateReport {
            session_id: session_id.to_string(),
            final_state: UpdateState::Failed,
            outcome: UpdateOutcome::ManualInterventionRequired {
                reason: UpdateFailure::RestoreFailed {
                    reason,
                    backup_path: backup_path.clone(),
                    staged_path: staged_path.clone(),
                },
                backup_path,
                staged_path,
            },
        }
    }

    /// Copy the backup over `live` (via a sibling and a rename) and self-check it.
    async fn restore_from_backup(&self, live: &Path, backup: &Path, expected: &Version) -> Result<(), String> {
        let restore_path = sibling(live, ".restore");
        if let Err(e) = copy_file_with_retries_and_sha256(backup, &restore_path, "restore").await {
            let _ = remove_if_exists(&restore_path).await;
            return Err(format!("could not copy backup: {:#}", e));
        }
        if let Err(e) = replace_atomically(&restore_path, live).await {
            let _ = remove_if_exists(&restore_path).await;
            return Err(format!("could not put backup in place: {:#}", e));
        }
        self.validator
            .validate(live, expected)
            .await
            .map_err(|e| format!("restored executable failed its self-check: {}", e))
    }

    /// Finish or repair a session a previous process left behind. `None` when nothing was pending.
    pub async fn recover(&self) -> anyhow::Result<Option<UpdateReport>> {
        let Some(marker) = self.markers.load().await? else {
            return Ok(None);
        };
        warn!(
            "[PHASE: update] [STEP: recover] found interrupted update session {} in state {} ({} -> {})",
            marker.session_id, marker.state, marker.previous_version, marker.target_version
        );
        let previous = Version::parse(&marker.previous_version)?;
        let target = Version::parse(&marker.target_version)?;
        let stage = marker.state;
        let reason = UpdateFailure::Interrupted(stage);

        let report = match stage {
            UpdateState::Completed => {
                self.cleanup(&marker.staged_path, &marker.backup_path).await;
                self.completed_report(&marker, &target)
            }
            s if !s.touches_live_executable() => {
                // The live executable was never replaced.
                self.cleanup(&marker.staged_path, &marker.backup_path).await;
                self.state_event(
                    &marker.session_id,
                    UpdateState::Failed,
                    EventLevel::Warn,
                    format!("Discarded update interrupted during {}; nothing changed", stage),
                );
                UpdateReport {
                    session_id: marker.session_id.clone(),
                    final_state: UpdateState::Failed,
                    outcome: UpdateOutcome::NoChange { stage, reason },
                }
            }
            _ => {
                let live = &marker.live_path;
                let forward = matches!(stage, UpdateState::Swapping | UpdateState::PostSwapValidating);
                if forward && self.validator.validate(live, &target).await.is_ok() {
                    self.cleanup(&marker.staged_path, &marker.backup_path).await;
                    self.completed_report(&marker, &target)
                } else if self.validator.validate(live, &previous).await.is_ok() {
                    self.cleanup(&marker.staged_path, &marker.backup_path).await;
                    self.restored_report(&marker, reason)
                } else {
                    match self.restore_from_backup(live, &marker.backup_path, &previous).await {
                        Ok(()) => {
                            self.cleanup(&marker.staged_path, &marker.backup_path).await;
                            self.restored_report(&marker, reason)
                        }
                        Err(e) => {
                            let failed = UpdateMarker {
                                state: UpdateState::Failed,
                                updated_at: Utc::now(),
                                ..marker.clone()
                            };
                            if let Err(save_err) = self.markers.save(&failed).await {
                                warn!("[PHASE: update] [STEP: recover] could not update marker: {:#}", save_err);
                            }
                            self.manual_intervention(
                                &marker.session_id,
                                format!("{} (recovering from {})", e, reason),
                                marker.backup_path.clone(),
                                marker.staged_path.clone(),
                            )
                        }
                    }
                }
            }
        };
        Ok(Some(report))
    }

    fn completed_report(&self, marker: &UpdateMarker, target: &Version) -> UpdateReport {
        self.state_event(
            &marker.session_id,
            UpdateState::Completed,
            EventLevel::Info,
            format!("Interrupted update to {} had already succeeded; cleaned up", target),
        );
        UpdateReport {
            session_id: marker.session_id.clone(),
            final_state: UpdateState::Completed,
            outcome: UpdateOutcome::Success {
                version: target.to_string(),
            },
        }
    }

    fn restored_report(&self, marker: &UpdateMarker, reason: UpdateFailure) -> UpdateReport {
        self.state_event(
            &marker.session_id,
            UpdateState::Restored,
            EventLevel::Warn,
            format!("Interrupted update rolled back to {}", marker.previous_version),
        );
        UpdateReport {
            session_id: marker.session_id.clone(),
            final_state: UpdateState::Restored,
            outcome: UpdateOutcome::Restored {
                stage: marker.state,
                reason,
            },
        }
    }

    fn enter(&self, session: &mut UpdateSession, state: UpdateState, message: impl Into<String>) {
        session.state = state;
        self.sink.state_changed(&session.id, state.as_str(), message);
    }

    fn state_event(&self, session_id: &str, state: UpdateState, level: EventLevel, message: String) {
        self.sink.emit(ProgressEvent {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            stage: state.as_str().to_string(),
            message,
            level,
            kind: EventKind::StateChanged,
        });
    }

    async fn persist(&self, session: &UpdateSession) -> anyhow::Result<()> {
        self.markers
            .save(&UpdateMarker {
                session_id: session.id.clone(),
                state: session.state,
                previous_version: self.current.to_string(),
                target_version: session.target.to_string(),
                live_path: self.paths.live_exe.clone(),
                backup_path: session.backup_path.clone(),
                staged_path: session.staged_path.clone(),
                updated_at: Utc::now(),
            })
            .await
    }

    async fn persist_best_effort(&self, session: &UpdateSession) {
        if let Err(e) = self.persist(session).await {
            warn!(
                "[PHASE: update] [STEP: marker] could not record state {}: {:#}",
                session.state, e
            );
        }
    }

    /// Remove the staged package, the backup, half-copied swap/restore siblings, a leftover
    /// rename-aside file and the marker.
    async fn cleanup(&self, staged: &Path, backup: &Path) {
        self.remove_quietly(staged).await;
        self.remove_quietly(backup).await;
        for suffix in [".new", ".restore"] {
            self.remove_quietly(&sibling(&self.paths.live_exe, suffix)).await;
        }
        // On Windows the renamed-aside executable may still be running; it goes next time.
        if let Err(e) = remove_if_exists(&sibling(&self.paths.live_exe, ".old")).await {
            debug!("[PHASE: update] [STEP: cleanup] {:#}", e);
        }
        if let Err(e) = self.markers.clear().await {
            warn!("[PHASE: update] [STEP: cleanup] could not clear marker: {:#}", e);
        }
    }

    async fn remove_quietly(&self, path: &Path) {
        if let Err(e) = remove_if_exists(path).await {
            warn!("[PHASE: update] [STEP: cleanup] {:#}", e);
        }
    }
}

/// Backup must exist, be non-empty, and hash identically to the live executable.
async fn verify_backup(live: &Path, backup: &Path, bytes: u64, sha: &str) -> Result<(), String> {
    let meta = tokio::fs::metadata(backup)
        .await
        .map_err(|e| format!("backup {:?} missing after copy: {}", backup, e))?;
    if meta.len() == 0 || meta.len() != bytes {
        return Err(format!(
            "backup {:?} has {} bytes, expected {}",
            backup,
            meta.len(),
            bytes
        ));
    }
    let on_disk = sha256_file(backup)
        .await
        .map_err(|e| format!("backup {:?} unreadable: {:#}", backup, e))?;
    let live_sha = sha256_file(live)
        .await
        .map_err(|e| format!("live executable {:?} unreadable: {:#}", live, e))?;
    if on_disk != sha || live_sha != sha {
        return Err(format!(
            "backup hash mismatch (copied={}, backup={}, live={})",
            sha, on_disk, live_sha
        ));
    }
    Ok(())
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), UpdateFailure> {
    if cancel.is_cancelled() {
        return Err(UpdateFailure::Cancelled);
    }
    Ok(())
}
