// Jira container installer
// Main library entry point

pub mod config;
pub mod error;
pub mod events;
pub mod installation;
pub mod models;
pub mod update;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{LoggingSettings, Settings};
use crate::events::{EventKind, EventLevel, EventSink, EventStream};
use crate::installation::docker::DockerCli;
use crate::installation::driver::MysqlConnectorProvider;
use crate::installation::health::RuntimeProbe;
use crate::installation::orchestrator::InstallOrchestrator;
use crate::installation::runtime::RuntimeClient;
use crate::models::requests::InstallRequest;
use crate::update::{HttpUpdateSource, SelfCheckValidator, UpdateEngine, UpdatePaths};
use crate::utils::path_resolver;
use crate::utils::version::Version;

/// Sent with every HTTP request (GitHub rejects requests without one).
pub const USER_AGENT: &str = "Jira-Installer/1.0";

const DRIVER_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Install(InstallRequest),
    Status,
    CheckUpdate,
    Update,
    ShowConfig,
}

/// Initialize logging with dual format (JSON + human-readable). Returns the log directory.
pub fn init_logging(settings: &LoggingSettings) -> Result<PathBuf> {
    let log_dir = path_resolver::resolve_log_folder(settings.directory.as_deref())?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("installer-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("installer-{}.txt", timestamp));

    // - JSON lines to .log
    // - human-readable lines to .txt
    // - optionally human-readable to stdout (off by default so progress rendering stays clean)
    let mut dispatch =
        fern::Dispatch::new().level(utils::logging::level_filter(&settings.level));

    if settings.stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!("{}", human_line(&message.to_string(), record)))
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = message.to_string();
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", json_line));
                })
                .chain(fern::log_file(&json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!("{}", human_line(&message.to_string(), record)))
                })
                .chain(fern::log_file(&txt_log_file)?),
        );

    dispatch.apply().context("Logger already initialized")?;

    info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(log_dir)
}

fn human_line(message: &str, record: &log::Record) -> String {
    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let (phase, step, cleaned_message) = utils::logging::parse_log_metadata(message);
    utils::logging::format_human_readable_log(
        &timestamp_local.to_string(),
        record.level(),
        record.target(),
        &cleaned_message,
        phase.as_deref(),
        step.as_deref(),
    )
}

/// Run one CLI command to completion and return the process exit code.
pub fn run_cli(command: CliCommand, config_path: Option<&Path>) -> i32 {
    let settings = match Settings::load(config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return 2;
        }
    };

    if let Err(e) = init_logging(&settings.logging) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }
    info!(
        "[PHASE: initialization] jira-installer {} starting at {} (command={:?})",
        Version::current(),
        chrono::Utc::now(),
        command_name(&command)
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            return 1;
        }
    };

    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let on_ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("[PHASE: cli] Ctrl-C received; stopping after the current step");
                on_ctrl_c.cancel();
            }
        });

        recover_pending_update(&settings).await;

        let result = match command {
            CliCommand::Install(request) => install(&settings, request, cancel).await,
            CliCommand::Status => status(&settings).await,
            CliCommand::CheckUpdate => check_update(&settings).await,
            CliCommand::Update => apply_update(&settings, cancel).await,
            CliCommand::ShowConfig => settings.to_toml().map(|toml| {
                println!("{}", toml);
                0
            }),
        };

        match result {
            Ok(code) => code,
            Err(e) => {
                error!("[PHASE: cli] command failed: {:#}", e);
                eprintln!("Error: {:#}", e);
                1
            }
        }
    })
}

fn command_name(command: &CliCommand) -> &'static str {
    match command {
        CliCommand::Install(_) => "install",
        CliCommand::Status => "status",
        CliCommand::CheckUpdate => "check-update",
        CliCommand::Update => "update",
        CliCommand::ShowConfig => "config",
    }
}

async fn install(settings: &Settings, request: InstallRequest, cancel: CancellationToken) -> Result<i32> {
    let docker = DockerCli::from_settings(&settings.runtime)?;
    let version = docker.preflight().await?;
    info!("[PHASE: preflight] Docker {} is available", version.raw);

    let runtime: Arc<dyn RuntimeClient> = Arc::new(docker);
    let probe = Arc::new(RuntimeProbe::new(runtime.clone())?);
    let cache_dir = path_resolver::resolve_cache_dir(settings.install.driver_cache_dir.as_deref())?;
    let drivers = Arc::new(MysqlConnectorProvider::new(
        cache_dir,
        settings.install.connector_base_url.clone(),
        DRIVER_DOWNLOAD_TIMEOUT,
    )?);

    let (sink, events) = EventSink::channel();
    let progress = spawn_progress(events);
    let orchestrator = InstallOrchestrator::new(runtime, probe, drivers, settings.install.clone(), sink);
    let report = orchestrator.install(&request, cancel).await;
    drop(orchestrator);
    let _ = progress.await;

    println!("{}", report.summary());
    Ok(if report.is_success() { 0 } else { 1 })
}

async fn status(settings: &Settings) -> Result<i32> {
    let docker = DockerCli::from_settings(&settings.runtime)?;
    let version = docker.preflight().await?;
    let report = docker.status_report().await?;
    println!("Docker {}", version.raw);
    println!("\nContainers:\n{}", report.containers);
    println!("\nNetworks:\n{}", report.networks);
    println!("\nVolumes:\n{}", report.volumes);
    Ok(0)
}

fn update_engine(settings: &Settings, sink: EventSink) -> Result<UpdateEngine> {
    let source = Arc::new(HttpUpdateSource::new(&settings.update)?);
    let validator = Arc::new(SelfCheckValidator::new(Duration::from_secs(
        settings.update.validation_timeout_secs,
    )));
    let paths = UpdatePaths {
        live_exe: path_resolver::resolve_current_exe()?,
        staging_dir: path_resolver::resolve_staging_dir(settings.update.staging_dir.as_deref())?,
        state_dir: path_resolver::resolve_state_dir(settings.update.state_dir.as_deref())?,
    };
    Ok(UpdateEngine::new(source, validator, paths, Version::current(), sink))
}

/// Finish or repair an update a previous launch left half-done. Never fails the launch.
async fn recover_pending_update(settings: &Settings) {
    let engine = match update_engine(settings, EventSink::detached()) {
        Ok(engine) => engine,
        Err(e) => {
            warn!("[PHASE: update] [STEP: recover] skipped: {:#}", e);
            return;
        }
    };
    match engine.recover().await {
        Ok(Some(report)) => eprintln!("{}", report.summary()),
        Ok(None) => {}
        Err(e) => {
            error!("[PHASE: update] [STEP: recover] failed: {:#}", e);
            eprintln!("Could not recover an interrupted update: {:#}", e);
        }
    }
}

async fn check_update(settings: &Settings) -> Result<i32> {
    let engine = update_engine(settings, EventSink::detached())?;
    match engine.check_for_update().await? {
        Some(d) => println!(
            "Update available: {} -> {}\nRun `jira-installer update` to install it.",
            engine.current_version(),
            d.version
        ),
        None => println!("jira-installer {} is up to date.", engine.current_version()),
    }
    Ok(0)
}

async fn apply_update(settings: &Settings, cancel: CancellationToken) -> Result<i32> {
    let (sink, events) = EventSink::channel();
    let engine = update_engine(settings, sink)?;
    let Some(descriptor) = engine.check_for_update().await? else {
        println!("jira-installer {} is up to date.", engine.current_version());
        return Ok(0);
    };

    let progress = spawn_progress(events);
    let report = engine.apply_update(&descriptor, cancel).await;
    drop(engine);
    let _ = progress.await;

    println!("{}", report.summary());
    Ok(if report.is_success() { 0 } else { 1 })
}

/// Render progress events until the producer drops its sink.
fn spawn_progress(mut events: EventStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{elapsed}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));

        while let Some(event) = events.recv().await {
            match (event.kind, event.level) {
                (EventKind::StateChanged, _) => {
                    bar.println(format!("==> {}: {}", event.stage, event.message))
                }
                (EventKind::Log, EventLevel::Info) => bar.set_message(event.message),
                (EventKind::Log, EventLevel::Warn) => bar.println(format!("    warning: {}", event.message)),
                (EventKind::Log, EventLevel::Error) => bar.println(format!("    error: {}", event.message)),
            }
        }
        bar.finish_and_clear();
    })
}
