//! Component lifecycle manager
//!
//! Runs install and upgrade tasks as an ordered step list with
//! strategy-gated steps, packaging-model dispatch, and a rollback
//! subroutine that restores the backed-up config and binary after a failed
//! mutation.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{info, warn};

use crate::catalog::{self, ComponentSpec, PackagingModel};
use crate::errors::ControlError;
use crate::probe;
use crate::remotefs::RemoteFs;
use crate::render::{self, ArtifactKind, Variables};
use crate::ssh::shell::{CommandChannel, RunRequest, DOWNLOAD_TIMEOUT};
use crate::tasks::{Step, Task, TaskHandle, TaskKind, TaskStatus, UpgradeStrategy};
use crate::utils::{backup_timestamp, shell_quote, tail_chars};

pub const STEP_PRE_CHECK: &str = "pre-check";
pub const STEP_BACKUP_CONFIG: &str = "backup-config";
pub const STEP_BACKUP_DATA: &str = "backup-data";
pub const STEP_STOP_SERVICE: &str = "stop-service";
pub const STEP_UPGRADE: &str = "upgrade";
pub const STEP_MIGRATE_CONFIG: &str = "migrate-config";
pub const STEP_START_SERVICE: &str = "start-service";
pub const STEP_HEALTH_CHECK: &str = "health-check";
pub const STEP_POST_CHECK: &str = "post-check";

const STEP_OUTPUT_TAIL: usize = 2000;

/// Build the ordered step list for an install or upgrade task. Install
/// tasks have nothing to back up or stop.
pub fn build_steps(kind: TaskKind, strategy: &UpgradeStrategy) -> Vec<Step> {
    let install = kind == TaskKind::DeployComponent;
    let mut steps = vec![Step::new(STEP_PRE_CHECK, "run pre-upgrade checks")];
    if strategy.backup_config && !install {
        steps.push(Step::new(STEP_BACKUP_CONFIG, "back up config files"));
    }
    if strategy.backup_data && !install {
        steps.push(Step::new(STEP_BACKUP_DATA, "archive data directories"));
    }
    if strategy.stop_before_switch && !install {
        steps.push(Step::new(STEP_STOP_SERVICE, "stop the running service"));
    }
    steps.push(Step::new(STEP_UPGRADE, "switch the component version"));
    if strategy.migrate_config {
        steps.push(Step::new(STEP_MIGRATE_CONFIG, "migrate config files"));
    }
    steps.push(Step::new(STEP_START_SERVICE, "start the service"));
    steps.push(Step::new(STEP_HEALTH_CHECK, "verify service health"));
    steps.push(Step::new(STEP_POST_CHECK, "run post-upgrade checks"));
    steps
}

/// Steps that can safely run twice, eligible for a single retry after a
/// command timeout
fn is_idempotent(step: &str) -> bool {
    matches!(
        step,
        STEP_PRE_CHECK
            | STEP_BACKUP_CONFIG
            | STEP_BACKUP_DATA
            | STEP_HEALTH_CHECK
            | STEP_POST_CHECK
    )
}

/// Per-packaging-model service operations
struct Driver<'a> {
    shell: &'a dyn CommandChannel,
    spec: &'a ComponentSpec,
}

impl<'a> Driver<'a> {
    fn new(shell: &'a dyn CommandChannel, spec: &'a ComponentSpec) -> Self {
        Self { shell, spec }
    }

    async fn start(&self) -> Result<String, ControlError> {
        let name = self.spec.service_name();
        let cmd = match self.spec.packaging {
            PackagingModel::Container => format!("docker start {}", shell_quote(name)),
            PackagingModel::ServiceUnitBinary => {
                format!("sudo systemctl start {}", shell_quote(name))
            }
            PackagingModel::BareBinary => {
                let binary = self.spec.binary_path.as_deref().ok_or_else(|| {
                    ControlError::ConfigError(format!("{} has no binary path", name))
                })?;
                format!("sudo nohup {} >/dev/null 2>&1 & echo started", shell_quote(binary))
            }
        };
        let output = self.shell.run_cmd(&cmd).await?;
        if !output.success() {
            return Err(ControlError::CommandFailed(format!(
                "failed to start {}: {}",
                name,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Attempt container stop, then unit stop; tolerate whichever does not
    /// apply. Bare binaries get a pkill.
    async fn stop(&self) -> Result<(), ControlError> {
        let name = self.spec.service_name();
        let cmd = format!(
            "docker stop {n} 2>/dev/null; sudo systemctl stop {n} 2>/dev/null; true",
            n = shell_quote(name)
        );
        self.shell.run_cmd(&cmd).await?;
        if self.spec.packaging == PackagingModel::BareBinary {
            if let Some(binary) = &self.spec.binary_path {
                let cmd = format!("sudo pkill -f {} 2>/dev/null; true", shell_quote(binary));
                self.shell.run_cmd(&cmd).await?;
            }
        }
        Ok(())
    }
}

/// Run an install or upgrade task to a terminal state. `shell` must be a
/// channel to the task's host.
pub async fn execute(
    mut handle: TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
) -> Result<Task, ControlError> {
    let strategy = handle.task.strategy.clone().unwrap_or_default();
    let timeout_secs = strategy.upgrade_timeout_secs;
    let mut mutated = false;

    handle
        .log(format!(
            "starting {:?} of {} ({} -> {})",
            handle.task.kind,
            handle.task.component,
            handle.task.from_version.as_deref().unwrap_or("none"),
            handle.task.to_version.as_deref().unwrap_or("?"),
        ))
        .await?;

    // A panic anywhere in the step machinery becomes the task's terminal
    // error and still goes through the rollback path below.
    let steps_fut = AssertUnwindSafe(run_steps(
        &mut handle,
        shell,
        spec,
        &strategy,
        &mut mutated,
    ))
    .catch_unwind()
    .map(|caught| match caught {
        Ok(result) => result,
        Err(panic) => Err(ControlError::Internal(format!(
            "worker panicked: {}",
            panic_message(&panic)
        ))),
    });

    // upgrade_timeout_secs = 0 means no overall deadline
    let outcome = if timeout_secs == 0 {
        steps_fut.await
    } else {
        match tokio::time::timeout(Duration::from_secs(timeout_secs), steps_fut).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::UpgradeTimeout(timeout_secs)),
        }
    };

    match outcome {
        Ok(()) => {
            handle.log("upgrade completed successfully").await?;
            handle.finish(TaskStatus::Completed, None).await
        }
        Err(ControlError::Canceled) => {
            // Cancellation never leaves the host mid-mutation
            if strategy.rollback_on_failure && mutated {
                handle.log("canceled mid-mutation, rolling back").await?;
                if let Err(e) = rollback(&mut handle, shell, spec).await {
                    warn!("rollback after cancel failed: {}", e);
                    handle.log(format!("rollback failed: {}", e)).await?;
                }
            }
            handle
                .finish(TaskStatus::Canceled, Some(ControlError::Canceled.to_string()))
                .await
        }
        Err(original) => {
            let original_msg = original.to_string();
            handle.log(format!("failed: {}", original_msg)).await?;
            if strategy.rollback_on_failure {
                handle.log("starting rollback").await?;
                match rollback(&mut handle, shell, spec).await {
                    Ok(()) => {
                        handle.log("rollback completed").await?;
                        handle
                            .finish(TaskStatus::RolledBack, Some(original_msg))
                            .await
                    }
                    Err(rollback_err) => {
                        let err = ControlError::RollbackFailed {
                            original: original_msg,
                            rollback: rollback_err.to_string(),
                        };
                        handle.finish(TaskStatus::Failed, Some(err.to_string())).await
                    }
                }
            } else {
                handle.finish(TaskStatus::Failed, Some(original_msg)).await
            }
        }
    }
}

async fn run_steps(
    handle: &mut TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
    strategy: &UpgradeStrategy,
    mutated: &mut bool,
) -> Result<(), ControlError> {
    let names: Vec<String> = handle.task.steps.iter().map(|s| s.name.clone()).collect();

    for (idx, name) in names.iter().enumerate() {
        if handle.is_canceled() {
            for remaining in &names[idx..] {
                handle.step_skipped(remaining).await?;
            }
            return Err(ControlError::Canceled);
        }

        if matches!(name.as_str(), STEP_STOP_SERVICE | STEP_UPGRADE) {
            *mutated = true;
        }

        handle.step_running(name).await?;
        handle.log(format!("executing step: {}", name)).await?;

        let mut result = run_step(handle, shell, spec, strategy, name).await;
        if matches!(result, Err(ControlError::Timeout(_))) && is_idempotent(name) {
            info!("step {} timed out, retrying once", name);
            handle.log(format!("step {} timed out, retrying", name)).await?;
            result = run_step(handle, shell, spec, strategy, name).await;
        }

        match result {
            Ok(output) => {
                handle
                    .step_completed(name, tail_chars(&output, STEP_OUTPUT_TAIL))
                    .await?;
                handle.log(format!("step {} completed", name)).await?;
            }
            Err(e) => {
                handle.step_failed(name, e.to_string()).await?;
                return Err(e);
            }
        }
    }
    Ok(())
}

async fn run_step(
    handle: &mut TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
    strategy: &UpgradeStrategy,
    name: &str,
) -> Result<String, ControlError> {
    match name {
        STEP_PRE_CHECK => pre_check(handle, shell, spec).await,
        STEP_BACKUP_CONFIG => backup_config(handle, shell, spec).await,
        STEP_BACKUP_DATA => backup_data(handle, shell, spec).await,
        STEP_STOP_SERVICE => stop_service(shell, spec).await,
        STEP_UPGRADE => upgrade(handle, shell, spec).await,
        STEP_MIGRATE_CONFIG => migrate_config(handle, shell, spec).await,
        STEP_START_SERVICE => Driver::new(shell, spec).start().await,
        STEP_HEALTH_CHECK => health_check(handle, shell, spec, strategy).await,
        STEP_POST_CHECK => post_check(shell, spec).await,
        other => Err(ControlError::Internal(format!("unknown step {}", other))),
    }
}

/// Disk below 90%, memory readable, and the observed version matches what
/// the caller declared as the starting point
async fn pre_check(
    handle: &TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
) -> Result<String, ControlError> {
    let disk = shell
        .run_cmd("df -h / | tail -1 | awk '{print $5}' | sed 's/%//'")
        .await?;
    if !disk.success() {
        return Err(ControlError::CommandFailed(format!(
            "unable to check disk usage: {}",
            disk.stderr.trim()
        )));
    }
    let usage: u32 = disk.stdout_trimmed().parse().unwrap_or(0);
    if usage > 90 {
        return Err(ControlError::CommandFailed(format!(
            "insufficient disk space: {}% used",
            usage
        )));
    }

    let memory = shell
        .run_cmd("free | grep Mem | awk '{print ($3/$2) * 100.0}'")
        .await?;
    if !memory.success() {
        return Err(ControlError::CommandFailed(format!(
            "unable to read memory usage: {}",
            memory.stderr.trim()
        )));
    }

    if let Some(from) = &handle.task.from_version {
        let report = probe::probe(shell, spec, handle.task.to_version.as_deref()).await?;
        if !report.presence.installed || &report.presence.version != from {
            return Err(ControlError::VersionDrift {
                expected: from.clone(),
                observed: if report.presence.installed {
                    report.presence.version
                } else {
                    "not installed".to_string()
                },
            });
        }
    }

    Ok(format!("disk usage {}%, memory check passed", usage))
}

/// Copy every known config file into a timestamped backup dir and record
/// it; the directory exists on the target before the upgrade step starts.
async fn backup_config(
    handle: &mut TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
) -> Result<String, ControlError> {
    let fs = RemoteFs::new(shell, handle.task.id.clone());
    let dir = RemoteFs::backup_dir(&spec.name, &backup_timestamp());
    fs.ensure_dir(&dir, 0o755).await?;

    let mut copied = 0;
    for path in &spec.config_paths {
        if fs.backup_file(path, &dir).await?.is_some() {
            copied += 1;
        }
    }

    handle
        .task
        .backup_paths
        .insert("config".to_string(), dir.clone());
    Ok(format!("backed up {} config file(s) to {}", copied, dir))
}

/// tar.gz each data directory into the backup dir
async fn backup_data(
    handle: &mut TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
) -> Result<String, ControlError> {
    let fs = RemoteFs::new(shell, handle.task.id.clone());
    let dir = match handle.task.backup_paths.get("config") {
        Some(dir) => dir.clone(),
        None => RemoteFs::backup_dir(&spec.name, &backup_timestamp()),
    };

    let mut archived = Vec::new();
    for data_dir in &spec.data_paths {
        let base = data_dir.rsplit('/').next().unwrap_or(data_dir.as_str());
        let archive_name = format!("{}_{}_data.tar.gz", spec.name, base);
        if let Some(dest) = fs.archive_dir(data_dir, &dir, &archive_name).await? {
            archived.push(dest);
        }
    }

    handle.task.backup_paths.insert("data".to_string(), dir);
    Ok(format!("archived {} data dir(s)", archived.len()))
}

/// Stop, settle, verify stopped
async fn stop_service(
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
) -> Result<String, ControlError> {
    Driver::new(shell, spec).stop().await?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    if probe::service_running(shell, spec.service_name()).await? {
        return Err(ControlError::ServiceStopTimeout(
            spec.service_name().to_string(),
        ));
    }
    Ok("service stopped".to_string())
}

async fn upgrade(
    handle: &mut TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
) -> Result<String, ControlError> {
    let to_version = handle
        .task
        .to_version
        .clone()
        .ok_or_else(|| ControlError::ConfigError("task has no target version".to_string()))?;
    let install = handle.task.kind == TaskKind::DeployComponent;

    match spec.packaging {
        PackagingModel::Container => upgrade_container(shell, spec, &to_version).await,
        PackagingModel::ServiceUnitBinary | PackagingModel::BareBinary => {
            upgrade_binary(handle, shell, spec, &to_version, install).await
        }
    }
}

/// Pull the new image tag, drop the old container, recreate from the
/// rendered run command
async fn upgrade_container(
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
    version: &str,
) -> Result<String, ControlError> {
    let image = render::render_image(spec, version)?;

    let pull = shell
        .run(
            RunRequest::new(format!("docker pull {}", shell_quote(&image)))
                .with_timeout(DOWNLOAD_TIMEOUT),
        )
        .await?;
    if !pull.success() {
        return Err(ControlError::CommandFailed(format!(
            "failed to pull {}: {}",
            image,
            pull.stderr.trim()
        )));
    }

    let name = spec.service_name();
    shell
        .run_cmd(&format!("docker rm {} 2>/dev/null; true", shell_quote(name)))
        .await?;

    let run_cmd = render::render_run_command(spec, version)?;
    let run = shell.run_cmd(&run_cmd).await?;
    if !run.success() {
        return Err(ControlError::CommandFailed(format!(
            "failed to create container {}: {}",
            name,
            run.stderr.trim()
        )));
    }

    Ok(format!("container recreated from {}", image))
}

/// Download the release archive to a staging path, back up the live
/// binary, then swap the staged binary into place. A failed or partial
/// download never touches the live binary.
async fn upgrade_binary(
    handle: &mut TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
    version: &str,
    install: bool,
) -> Result<String, ControlError> {
    let fs = RemoteFs::new(shell, handle.task.id.clone());
    let url = render::render_download_url(spec, version)?;
    let binary = spec
        .binary_path
        .clone()
        .ok_or_else(|| ControlError::ConfigError(format!("{} has no binary path", spec.name)))?;

    let archive = format!("/tmp/{}_{}.tar.gz", spec.name, version);
    let download = shell
        .run(
            RunRequest::new(format!(
                "wget -q -O {} {}",
                shell_quote(&archive),
                shell_quote(&url)
            ))
            .with_timeout(DOWNLOAD_TIMEOUT),
        )
        .await?;
    if !download.success() {
        return Err(ControlError::CommandFailed(format!(
            "failed to download {}: {}",
            url,
            download.stderr.trim()
        )));
    }

    let extract = shell
        .run_cmd(&format!("tar -xzf {} -C /tmp", shell_quote(&archive)))
        .await?;
    if !extract.success() {
        return Err(ControlError::CommandFailed(format!(
            "failed to extract archive: {}",
            extract.stderr.trim()
        )));
    }

    let staged = format!("/tmp/{}", render::render_archive_binary(spec, version)?);
    if !fs.exists(&staged).await? {
        return Err(ControlError::CommandFailed(format!(
            "archive did not contain expected binary {}",
            staged
        )));
    }

    // Keep the previous binary next to the new one, timestamp-suffixed
    let backup = format!("{}.backup_{}", binary, backup_timestamp());
    shell
        .run_cmd(&format!(
            "test -f {b} && sudo cp {b} {p}; true",
            b = shell_quote(&binary),
            p = shell_quote(&backup)
        ))
        .await?;

    let swap = shell
        .run_cmd(&format!(
            "sudo chmod +x {s} && sudo mv {s} {b}",
            s = shell_quote(&staged),
            b = shell_quote(&binary)
        ))
        .await?;
    if !swap.success() {
        return Err(ControlError::CommandFailed(format!(
            "failed to replace binary: {}",
            swap.stderr.trim()
        )));
    }

    if spec.packaging == PackagingModel::ServiceUnitBinary {
        if install {
            let unit = render::render_artifact(spec, ArtifactKind::SystemdUnit, &Variables::new())?;
            fs.write_file(&unit).await?;
            let enable = shell
                .run_cmd(&format!(
                    "sudo systemctl daemon-reload && sudo systemctl enable {}",
                    shell_quote(spec.service_name())
                ))
                .await?;
            if !enable.success() {
                return Err(ControlError::CommandFailed(format!(
                    "failed to enable unit: {}",
                    enable.stderr.trim()
                )));
            }
        } else {
            let reload = shell.run_cmd("sudo systemctl daemon-reload").await?;
            if !reload.success() {
                return Err(ControlError::CommandFailed(format!(
                    "failed to reload units: {}",
                    reload.stderr.trim()
                )));
            }
        }
    }

    Ok(format!("binary replaced with {} (previous kept at {})", version, backup))
}

/// Run the migration script for this (component, fromMajor -> toMajor)
/// boundary when one exists; otherwise a no-op
async fn migrate_config(
    handle: &TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
) -> Result<String, ControlError> {
    let (Some(from), Some(to)) = (&handle.task.from_version, &handle.task.to_version) else {
        return Ok("no config migration needed".to_string());
    };
    let migration = catalog::global().migration(&spec.name, major_of(from), major_of(to));
    let Some(migration) = migration else {
        return Ok("no config migration needed".to_string());
    };

    let output = shell.run_cmd(&format!("sudo sh -c {}", shell_quote(&migration.script))).await?;
    if !output.success() {
        return Err(ControlError::CommandFailed(format!(
            "config migration failed: {}",
            output.stderr.trim()
        )));
    }
    Ok(output.stdout)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn major_of(version: &str) -> u64 {
    version
        .split('.')
        .next()
        .and_then(|part| part.parse().ok())
        .unwrap_or(0)
}

/// Settle, then require the service up, the health command passing, and
/// the re-probed version equal to the target
async fn health_check(
    handle: &TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
    strategy: &UpgradeStrategy,
) -> Result<String, ControlError> {
    tokio::time::sleep(Duration::from_secs(strategy.health_check_delay_secs)).await;

    if !probe::service_running(shell, spec.service_name()).await? {
        return Err(ControlError::CommandFailed(format!(
            "service {} is not running after start",
            spec.service_name()
        )));
    }

    let mut summary = String::new();
    if let Some(health_cmd) = &spec.health_check {
        let output = shell.run_cmd(health_cmd).await?;
        if !output.success() {
            return Err(ControlError::CommandFailed(format!(
                "health check failed: {}",
                output.stderr_tail(10)
            )));
        }
        summary.push_str("health command passed; ");
    }

    let expected = handle
        .task
        .to_version
        .clone()
        .ok_or_else(|| ControlError::ConfigError("task has no target version".to_string()))?;
    let report = probe::probe(shell, spec, Some(&expected)).await?;
    if report.presence.version != expected {
        return Err(ControlError::VersionMismatch {
            expected,
            observed: report.presence.version,
        });
    }

    summary.push_str(&format!("version verified: {}", report.presence.version));
    Ok(summary)
}

/// Tail recent logs (error lines are a warning, not a failure) and drop
/// temp artifacts
async fn post_check(
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
) -> Result<String, ControlError> {
    if !probe::service_running(shell, spec.service_name()).await? {
        return Err(ControlError::CommandFailed(format!(
            "service {} is not running after upgrade",
            spec.service_name()
        )));
    }

    let mut summary = String::new();
    if let Some(tail_cmd) = &spec.log_tail {
        let output = shell.run_cmd(tail_cmd).await?;
        if output.success() {
            let lower = output.stdout.to_lowercase();
            if lower.contains("error") || lower.contains("fatal") {
                summary.push_str("warning: recent logs contain error lines; ");
            } else {
                summary.push_str("no errors in recent logs; ");
            }
        }
    }

    let _ = shell
        .run_cmd(&format!("rm -f /tmp/{}_* 2>/dev/null; true", spec.name))
        .await?;

    summary.push_str("post-upgrade check completed");
    Ok(summary)
}

/// Restore the most recent config and binary backups and restart.
/// Used after a failed mutation; the task ends `rolled-back` when this
/// succeeds.
async fn rollback(
    handle: &mut TaskHandle,
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
) -> Result<(), ControlError> {
    let fs = RemoteFs::new(shell, handle.task.id.clone());
    let driver = Driver::new(shell, spec);

    driver.stop().await?;

    if let Some(dir) = handle.task.backup_paths.get("config").cloned() {
        for path in &spec.config_paths {
            let name = path.rsplit('/').next().unwrap_or(path.as_str());
            let backup = format!("{}/{}", dir, name);
            if fs.exists(&backup).await? {
                fs.restore_file(&backup, path).await?;
            }
        }
        handle.log("config files restored from backup").await?;
    }

    if let Some(binary) = &spec.binary_path {
        let find = shell
            .run_cmd(&format!(
                "ls -t {}.backup_* 2>/dev/null | head -1",
                shell_quote(binary)
            ))
            .await?;
        let latest = find.stdout_trimmed().to_string();
        if find.success() && !latest.is_empty() {
            fs.restore_file(&latest, binary).await?;
            handle.log("binary restored from backup").await?;
        }
    }

    driver.start().await?;
    if !probe::service_running(shell, spec.service_name()).await? {
        return Err(ControlError::CommandFailed(format!(
            "service {} did not come back after rollback",
            spec.service_name()
        )));
    }
    Ok(())
}
