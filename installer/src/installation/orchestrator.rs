//! Install orchestrator.
//!
//! Drives one install session through
//! `Validated → NetworkReady → [DatabaseProvisioned] → ApplicationContainerRunning →
//! HealthChecked → Completed`, recording every resource it creates. Any failure (or
//! cancellation) stops forward progress and tears the recorded resources down in reverse order.
//! Resources that could not be removed are reported as leaked, never swallowed.

use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::InstallSettings;
use crate::error::{InstallFailure, RuntimeCommandError};
use crate::events::{EventKind, EventLevel, EventSink, ProgressEvent};
use crate::installation::driver::DriverProvider;
use crate::installation::health::{
    wait_for_database, wait_until_ready, DatabaseWaitPolicy, ProbeTarget, ReadinessProbe,
};
use crate::installation::plan::{DatabasePlan, InstallPlan};
use crate::installation::runtime::{ContainerSpec, RuntimeClient};
use crate::installation::session::InstallSession;
use crate::models::requests::InstallRequest;
use crate::models::responses::{InstallOutcome, InstallReport, Resource, ResourceKind};
use crate::models::state::InstallState;

pub struct InstallOrchestrator {
    runtime: Arc<dyn RuntimeClient>,
    probe: Arc<dyn ReadinessProbe>,
    drivers: Arc<dyn DriverProvider>,
    settings: InstallSettings,
    sink: EventSink,
}

impl InstallOrchestrator {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        probe: Arc<dyn ReadinessProbe>,
        drivers: Arc<dyn DriverProvider>,
        settings: InstallSettings,
        sink: EventSink,
    ) -> Self {
        Self {
            runtime,
            probe,
            drivers,
            settings,
            sink,
        }
    }

    /// Run one install session to a terminal state.
    pub async fn install(&self, request: &InstallRequest, cancel: CancellationToken) -> InstallReport {
        let started = Instant::now();
        let mut session = InstallSession::new();
        info!(
            "[PHASE: installation] [STEP: session] install entered (session={}, version={})",
            session.id(),
            request.version
        );

        let plan = match InstallPlan::build(request, &self.settings) {
            Ok(plan) => plan,
            Err(e) => {
                self.log(&session, EventLevel::Error, format!("Validation failed: {}", e));
                // Nothing was created, so there is nothing to roll back.
                return self.rollback(session, InstallFailure::Validation(e)).await;
            }
        };
        self.advance(
            &mut session,
            InstallState::Validated,
            format!(
                "Jira {} on port {} (container '{}', network '{}', {} database)",
                plan.profile.version,
                plan.host_port,
                plan.container_name,
                plan.network_name,
                if plan.database.is_some() { "external MySQL" } else { "built-in" }
            ),
        );

        let report = match self.provision(&plan, &mut session, &cancel).await {
            Ok(()) => {
                let url = plan.url();
                self.advance(&mut session, InstallState::Completed, format!("Jira is available at {}", url));
                InstallReport {
                    session_id: session.id().to_string(),
                    final_state: InstallState::Completed,
                    outcome: InstallOutcome::Success {
                        url,
                        resources: session.resources().to_vec(),
                    },
                }
            }
            Err(failure) => self.rollback(session, failure).await,
        };
        debug_assert!(report.final_state.is_terminal());

        info!(
            "[PHASE: installation] [STEP: session] install exit (session={}, final_state={}, duration_ms={})",
            report.session_id,
            report.final_state,
            started.elapsed().as_millis()
        );
        report
    }

    async fn provision(
        &self,
        plan: &InstallPlan,
        session: &mut InstallSession,
        cancel: &CancellationToken,
    ) -> Result<(), InstallFailure> {
        ensure_not_cancelled(cancel)?;
        session.begin(InstallState::NetworkReady);
        self.ensure_network(plan, session).await?;
        self.advance(
            session,
            InstallState::NetworkReady,
            format!("Network '{}' ready", plan.network_name),
        );

        if let Some(db) = &plan.database {
            ensure_not_cancelled(cancel)?;
            session.begin(InstallState::DatabaseProvisioned);
            self.provision_database(plan, db, session, cancel).await?;
            self.advance(
                session,
                InstallState::DatabaseProvisioned,
                format!("MySQL '{}' is accepting connections", db.container_name),
            );
        }

        ensure_not_cancelled(cancel)?;
        session.begin(InstallState::ApplicationContainerRunning);
        self.provision_application(plan, session, cancel).await?;
        self.advance(
            session,
            InstallState::ApplicationContainerRunning,
            format!("Container '{}' started", plan.container_name),
        );

        ensure_not_cancelled(cancel)?;
        session.begin(InstallState::HealthChecked);
        self.log(
            session,
            EventLevel::Info,
            format!(
                "Waiting up to {}s for Jira to answer on {}",
                plan.health_deadline.as_secs(),
                plan.url()
            ),
        );
        let target = ProbeTarget {
            container: plan.container_name.clone(),
            host_port: plan.host_port,
        };
        let observation = wait_until_ready(
            self.probe.as_ref(),
            &target,
            &plan.profile.readiness,
            plan.health_deadline,
            plan.health_poll,
            cancel,
        )
        .await?;
        self.advance(session, InstallState::HealthChecked, observation.detail);
        Ok(())
    }

    async fn ensure_network(&self, plan: &InstallPlan, session: &mut InstallSession) -> Result<(), InstallFailure> {
        let name = &plan.network_name;
        if self.runtime.network_exists(name).await? {
            self.log(session, EventLevel::Info, format!("Network '{}' already exists; reusing it", name));
            return Ok(());
        }

        match self.runtime.create_network(name).await {
            Ok(()) => {
                session.record(Resource::network(name.clone()));
                self.log(session, EventLevel::Info, format!("Created network '{}'", name));
                Ok(())
            }
            // Someone else created it between the check and the create. Not ours to remove.
            Err(RuntimeCommandError::NameInUse { .. }) => {
                self.log(session, EventLevel::Warn, format!("Network '{}' appeared concurrently; reusing it", name));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn provision_database(
        &self,
        plan: &InstallPlan,
        db: &DatabasePlan,
        session: &mut InstallSession,
        cancel: &CancellationToken,
    ) -> Result<(), InstallFailure> {
        self.log(session, EventLevel::Info, format!("Pulling {}", db.image));
        self.runtime.pull_image(&db.image).await?;

        if self.runtime.volume_exists(&db.volume_name).await? {
            return Err(InstallFailure::ExistingVolume {
                name: db.volume_name.clone(),
            });
        }

        let spec = db.container_spec(&plan.network_name);
        self.start_container(&spec, Some(&db.volume_name), session).await?;

        self.log(
            session,
            EventLevel::Info,
            format!("Waiting for MySQL in '{}' to accept connections", db.container_name),
        );
        let policy = DatabaseWaitPolicy::from_settings(&self.settings);
        wait_for_database(
            self.runtime.as_ref(),
            &db.container_name,
            &policy,
            cancel,
        )
        .await
    }

    async fn provision_application(
        &self,
        plan: &InstallPlan,
        session: &mut InstallSession,
        cancel: &CancellationToken,
    ) -> Result<(), InstallFailure> {
        let driver = match &plan.driver_version {
            Some(version) => {
                self.log(session, EventLevel::Info, format!("Preparing MySQL Connector/J {}", version));
                let artifact = self.drivers.provide(version).await?;
                self.log(
                    session,
                    EventLevel::Info,
                    format!("JDBC driver {} ready", artifact.file_name),
                );
                Some(artifact)
            }
            None => None,
        };
        ensure_not_cancelled(cancel)?;

        let image = &plan.profile.base_image_reference;
        self.log(session, EventLevel::Info, format!("Pulling {}", image));
        self.runtime.pull_image(image).await?;

        let spec = plan.application_spec(driver.as_ref());
        self.start_container(&spec, None, session).await?;

        self.log(
            session,
            EventLevel::Info,
            format!("Setting JVM_SUPPORT_RECOMMENDED_ARGS=\"{}\"", plan.profile.jvm_support_args),
        );
        let out = self
            .runtime
            .exec(&spec.name, &[], &plan.jvm_patch_command())
            .await?;
        if !out.success() {
            return Err(RuntimeCommandError::Failed {
                operation: "jvm_args_patch".to_string(),
                exit_code: out.exit_code,
                raw: out.stderr.trim().to_string(),
            }
            .into());
        }
        self.runtime.restart_container(&spec.name).await?;
        self.log(session, EventLevel::Info, format!("Restarted '{}' with patched JVM arguments", spec.name));
        Ok(())
    }

    /// Check the name right before creating (never cached), run the container and record it.
    ///
    /// `volume` is the named volume docker creates for the container. It is recorded ahead of
    /// the container: teardown runs newest first and docker refuses to remove a mounted volume.
    async fn start_container(
        &self,
        spec: &ContainerSpec,
        volume: Option<&str>,
        session: &mut InstallSession,
    ) -> Result<(), InstallFailure> {
        if self.runtime.container_exists(&spec.name).await? {
            return Err(RuntimeCommandError::NameInUse {
                name: spec.name.clone(),
                raw: format!("a container named '{}' already exists", spec.name),
            }
            .into());
        }

        match self.runtime.run_container(spec).await {
            Ok(_id) => {
                if let Some(volume) = volume {
                    session.record(Resource::volume(volume));
                }
                session.record(Resource::container(spec.name.clone()));
                self.log(session, EventLevel::Info, format!("Started container '{}'", spec.name));
                Ok(())
            }
            Err(e) => {
                // A name collision means the container belongs to someone else. Anything else
                // (port bind failure, timeout) may still have left our container behind.
                if !matches!(e, RuntimeCommandError::NameInUse { .. }) {
                    if let Some(volume) = volume {
                        if let Ok(true) = self.runtime.volume_exists(volume).await {
                            warn!(
                                "[PHASE: installation] [STEP: docker] run failed but volume {} exists; recording it for rollback",
                                volume
                            );
                            session.record(Resource::volume(volume));
                        }
                    }
                    if let Ok(true) = self.runtime.container_exists(&spec.name).await {
                        warn!(
                            "[PHASE: installation] [STEP: docker] run failed but container {} exists; recording it for rollback",
                            spec.name
                        );
                        session.record(Resource::container(spec.name.clone()));
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn rollback(&self, mut session: InstallSession, failure: InstallFailure) -> InstallReport {
        let failed_step = session.current_step();
        self.log(
            &session,
            EventLevel::Error,
            format!("Step {} failed: {}", failed_step, failure),
        );
        session.reach(InstallState::RollingBack);
        self.sink.state_changed(
            session.id(),
            InstallState::RollingBack.as_str(),
            format!("Rolling back {} resource(s)", session.resources().len()),
        );

        let mut torn_down = Vec::new();
        let mut leaked = Vec::new();
        for resource in session.teardown_order() {
            if self.teardown(&session, &resource).await {
                torn_down.push(resource);
            } else {
                leaked.push(resource);
            }
        }

        let session_id = session.id().to_string();
        if leaked.is_empty() {
            session.reach(InstallState::RolledBack);
            self.sink.state_changed(
                &session_id,
                InstallState::RolledBack.as_str(),
                format!("Install failed at {}; all created resources were removed", failed_step),
            );
            InstallReport {
                session_id,
                final_state: InstallState::RolledBack,
                outcome: InstallOutcome::RolledBack {
                    failed_step,
                    reason: failure,
                    torn_down,
                },
            }
        } else {
            session.reach(InstallState::Failed);
            let list = leaked.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ");
            self.sink.emit(ProgressEvent {
                timestamp: chrono::Utc::now(),
                session_id: session_id.clone(),
                stage: InstallState::Failed.as_str().to_string(),
                message: format!("Rollback incomplete; remove manually: {}", list),
                level: EventLevel::Error,
                kind: EventKind::StateChanged,
            });
            InstallReport {
                session_id,
                final_state: InstallState::Failed,
                outcome: InstallOutcome::FailedWithLeak {
                    failed_step,
                    reason: failure,
                    leaked,
                },
            }
        }
    }

    /// Best-effort removal with a bounded number of retries. A resource that is already gone
    /// counts as removed.
    async fn teardown(&self, session: &InstallSession, resource: &Resource) -> bool {
        let attempts = self.settings.teardown_retries.saturating_add(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let result = match resource.kind {
                ResourceKind::Container => self.runtime.stop_and_remove(&resource.id).await,
                ResourceKind::Network => self.runtime.remove_network(&resource.id).await,
                ResourceKind::Volume => self.runtime.remove_volume(&resource.id).await,
            };
            match result {
                Ok(()) | Err(RuntimeCommandError::NotFound { .. }) => {
                    self.log(session, EventLevel::Info, format!("Removed {}", resource));
                    return true;
                }
                Err(e) => {
                    warn!(
                        "[PHASE: rollback] [STEP: teardown] removing {} failed (attempt {}/{}): {}",
                        resource, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            self.log(session, EventLevel::Error, format!("Could not remove {}: {}", resource, e));
        }
        false
    }

    fn advance(&self, session: &mut InstallSession, state: InstallState, message: impl Into<String>) {
        session.reach(state);
        self.sink.state_changed(session.id(), state.as_str(), message);
    }

    fn log(&self, session: &InstallSession, level: EventLevel, message: impl Into<String>) {
        self.sink
            .log(session.id(), session.current_step().as_str(), level, message);
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), InstallFailure> {
    if cancel.is_cancelled() {
        return Err(InstallFailure::Cancelled);
    }
    Ok(())
}
