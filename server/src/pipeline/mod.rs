//! Configuration deployment pipeline
//!
//! Per target: connect, back up the existing file, upload to a staging
//! path, validate with the component's upstream CLI validator, atomically
//! rename into place, reload, verify. Validation runs against the staging
//! file, so a rejected config never replaces the live one. On a later
//! failure the backed-up config is restored and the service reloaded again
//! before the target is marked failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};

use crate::catalog;
use crate::errors::ControlError;
use crate::fanout::{FanoutExecutor, FanoutOptions, TargetResult};
use crate::inventory::Host;
use crate::probe;
use crate::remotefs::RemoteFs;
use crate::render::Artifact;
use crate::ssh::shell::CommandChannel;
use crate::ssh::SessionSource;
use crate::tasks::{Step, StepStatus, Task, TaskHandle, TaskStatus};
use crate::utils::{backup_timestamp, shell_quote};

pub const STEP_CONNECT: &str = "connect";
pub const STEP_BACKUP_EXISTING: &str = "backup-existing";
pub const STEP_UPLOAD: &str = "upload";
pub const STEP_VALIDATE: &str = "validate";
pub const STEP_RELOAD: &str = "reload";
pub const STEP_VERIFY: &str = "verify";

/// One config deployment, fanned out over targets
#[derive(Debug, Clone)]
pub struct ConfigDeployRequest {
    pub component: String,
    pub artifact: Artifact,
    pub validate: bool,
    pub backup: bool,
    pub auto_restart: bool,
    /// POST here instead of restarting via systemctl when set
    pub reload_endpoint: Option<String>,
}

/// One deployment target
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub host: Host,
    /// Unit/service override; defaults to the component name
    pub service_name: Option<String>,
    /// Destination override; defaults to the artifact's target path
    pub config_path: Option<String>,
}

/// Live progress emitted while a target walks the pipeline
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub target_id: String,
    pub step: &'static str,
    pub status: StepStatus,
    pub detail: Option<String>,
}

/// Service state collected by the verify step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub status: String,
    #[serde(default)]
    pub pid: Option<String>,
    #[serde(default)]
    pub version_banner: Option<String>,
    /// Hash of the deployed file; identical redeployments verify to the
    /// same value
    #[serde(default)]
    pub config_sha256: Option<String>,
}

/// The full pipeline step list for one target
pub fn build_steps(req: &ConfigDeployRequest) -> Vec<Step> {
    let mut steps = vec![Step::new(STEP_CONNECT, "acquire SSH client")];
    if req.backup {
        steps.push(Step::new(STEP_BACKUP_EXISTING, "back up the current config"));
    }
    steps.push(Step::new(STEP_UPLOAD, "upload the rendered config"));
    if req.validate {
        steps.push(Step::new(STEP_VALIDATE, "run the upstream validator"));
    }
    if req.auto_restart {
        steps.push(Step::new(STEP_RELOAD, "reload the service"));
    }
    steps.push(Step::new(STEP_VERIFY, "verify service state"));
    steps
}

/// One step per target, used for multi-target task records
pub fn build_target_steps(targets: &[TargetSpec]) -> Vec<Step> {
    targets
        .iter()
        .map(|t| {
            Step::new(
                format!("target:{}", t.host.id),
                format!("deploy config to {}", t.host.addr),
            )
        })
        .collect()
}

/// Run a config deployment task to a terminal state
pub async fn execute(
    mut handle: TaskHandle,
    sessions: Arc<dyn SessionSource>,
    options: FanoutOptions,
    req: ConfigDeployRequest,
    targets: Vec<TargetSpec>,
) -> Result<Task, ControlError> {
    let single_target = targets.len() == 1;
    let cancel = handle.cancel_flag();
    let req = Arc::new(req);
    let task_id = handle.task.id.clone();

    handle
        .log(format!(
            "deploying {} config to {} target(s)",
            req.component,
            targets.len()
        ))
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<StepEvent>();
    let executor = FanoutExecutor::new(options);
    let run_fut = {
        let sessions = sessions.clone();
        let req = req.clone();
        executor.run(
            targets,
            cancel.clone(),
            |t| t.host.id.clone(),
            move |target| {
                let sessions = sessions.clone();
                let req = req.clone();
                let tx = tx.clone();
                let task_id = task_id.clone();
                async move { deploy_to_target(sessions, req, target, task_id, tx).await }
            },
        )
    };
    tokio::pin!(run_fut);

    let report = loop {
        tokio::select! {
            report = &mut run_fut => break report,
            maybe_ev = rx.recv() => match maybe_ev {
                Some(ev) => apply_event(&mut handle, single_target, ev).await?,
                None => break (&mut run_fut).await,
            },
        }
    };
    while let Ok(ev) = rx.try_recv() {
        apply_event(&mut handle, single_target, ev).await?;
    }

    if !single_target {
        for result in &report.results {
            let step = format!("target:{}", result.target_id);
            if result.success {
                handle.step_completed(&step, result.message.clone()).await?;
            } else {
                handle.step_failed(&step, result.message.clone()).await?;
            }
        }
    }

    let summary = report.summary.clone();
    handle.task.details = Some(serde_json::to_value(&report)?);
    handle
        .log(format!(
            "fan-out finished: {} total, {} successful, {} failed, {} partial",
            summary.total, summary.successful, summary.failed, summary.partial
        ))
        .await?;

    if cancel.is_canceled() {
        return handle
            .finish(TaskStatus::Canceled, Some(ControlError::Canceled.to_string()))
            .await;
    }
    if summary.failed == 0 && summary.partial == 0 {
        handle.finish(TaskStatus::Completed, None).await
    } else {
        let failed = report
            .results
            .iter()
            .filter(|r| !r.success)
            .map(|r| format!("{}: {}", r.target_id, r.message))
            .collect::<Vec<_>>()
            .join("; ");
        handle.finish(TaskStatus::Failed, Some(failed)).await
    }
}

async fn apply_event(
    handle: &mut TaskHandle,
    single_target: bool,
    ev: StepEvent,
) -> Result<(), ControlError> {
    if single_target {
        match ev.status {
            StepStatus::Running => handle.step_running(ev.step).await?,
            StepStatus::Completed => {
                handle
                    .step_completed(ev.step, ev.detail.unwrap_or_default())
                    .await?
            }
            StepStatus::Failed => {
                handle
                    .step_failed(ev.step, ev.detail.unwrap_or_default())
                    .await?
            }
            StepStatus::Skipped => handle.step_skipped(ev.step).await?,
            StepStatus::Pending => {}
        }
    } else {
        handle
            .log(format!(
                "[{}] {} {:?}{}",
                ev.target_id,
                ev.step,
                ev.status,
                ev.detail.map(|d| format!(": {}", d)).unwrap_or_default()
            ))
            .await?;
    }
    Ok(())
}

struct EventSink<'a> {
    target_id: &'a str,
    tx: &'a UnboundedSender<StepEvent>,
}

impl<'a> EventSink<'a> {
    fn emit(&self, step: &'static str, status: StepStatus, detail: Option<String>) {
        let _ = self.tx.send(StepEvent {
            target_id: self.target_id.to_string(),
            step,
            status,
            detail,
        });
    }

    fn running(&self, step: &'static str) {
        self.emit(step, StepStatus::Running, None);
    }

    fn completed(&self, step: &'static str, detail: impl Into<String>) {
        self.emit(step, StepStatus::Completed, Some(detail.into()));
    }

    fn skipped(&self, step: &'static str) {
        self.emit(step, StepStatus::Skipped, None);
    }

    fn failed(&self, step: &'static str, err: &ControlError) {
        self.emit(step, StepStatus::Failed, Some(err.to_string()));
    }
}

/// Deploy the rendered config to one target, reporting progress as step
/// events. Never panics the fan-out: every failure folds into the result.
pub async fn deploy_to_target(
    sessions: Arc<dyn SessionSource>,
    req: Arc<ConfigDeployRequest>,
    target: TargetSpec,
    task_id: String,
    events: UnboundedSender<StepEvent>,
) -> TargetResult {
    let started = Instant::now();
    let target_id = target.host.id.clone();
    let sink = EventSink {
        target_id: &target_id,
        tx: &events,
    };

    let mut committed = false;
    let mut backup_path: Option<String> = None;
    let outcome = run_target(
        sessions.as_ref(),
        &req,
        &target,
        &task_id,
        &sink,
        &mut committed,
        &mut backup_path,
    )
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(service) => TargetResult {
            target_id,
            success: true,
            partial: false,
            message: "config deployed".to_string(),
            duration_ms,
            details: json!({
                "backup_path": backup_path,
                "service": service,
            }),
        },
        Err(err) => TargetResult {
            target_id,
            success: false,
            partial: committed,
            message: err.to_string(),
            duration_ms,
            details: json!({ "backup_path": backup_path }),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_target(
    sessions: &dyn SessionSource,
    req: &ConfigDeployRequest,
    target: &TargetSpec,
    task_id: &str,
    sink: &EventSink<'_>,
    committed: &mut bool,
    backup_path: &mut Option<String>,
) -> Result<ServiceInfo, ControlError> {
    let service_name = target
        .service_name
        .clone()
        .unwrap_or_else(|| req.component.clone());
    let config_path = target
        .config_path
        .clone()
        .unwrap_or_else(|| req.artifact.target_path.clone());

    // connect
    sink.running(STEP_CONNECT);
    let session = match sessions.connect(&target.host).await {
        Ok(session) => session,
        Err(e) => {
            sink.failed(STEP_CONNECT, &e);
            return Err(e);
        }
    };
    sink.completed(
        STEP_CONNECT,
        format!("{}:{}", target.host.addr, target.host.port),
    );
    let shell: &dyn CommandChannel = session.as_ref();
    let fs = RemoteFs::new(shell, task_id);

    // backup-existing
    if req.backup {
        sink.running(STEP_BACKUP_EXISTING);
        match backup_existing(shell, &fs, req, target, &config_path).await {
            Ok(Some(path)) => {
                *backup_path = Some(path.clone());
                sink.completed(STEP_BACKUP_EXISTING, path);
            }
            Ok(None) => sink.completed(STEP_BACKUP_EXISTING, "no existing config"),
            Err(e) => {
                sink.failed(STEP_BACKUP_EXISTING, &e);
                return Err(e);
            }
        }
    } else {
        sink.skipped(STEP_BACKUP_EXISTING);
    }

    // upload: stage the new bytes; the live file is only replaced after
    // validation (or immediately when validation is off)
    sink.running(STEP_UPLOAD);
    let mut artifact = req.artifact.clone();
    artifact.target_path = config_path.clone();
    let staging = match stage_upload(&fs, &artifact).await {
        Ok(staging) => staging,
        Err(e) => {
            sink.failed(STEP_UPLOAD, &e);
            return Err(e);
        }
    };
    if !req.validate {
        if let Err(e) = fs.commit(&staging, &config_path).await {
            sink.failed(STEP_UPLOAD, &e);
            return fail_with_rollback(shell, &fs, req, &service_name, &config_path, backup_path, e)
                .await;
        }
        *committed = true;
    }
    sink.completed(STEP_UPLOAD, config_path.clone());

    // validate against the staging file
    if req.validate {
        sink.running(STEP_VALIDATE);
        match validate_staged(shell, req, &staging).await {
            Ok(detail) => {
                if let Err(e) = fs.commit(&staging, &config_path).await {
                    sink.failed(STEP_VALIDATE, &e);
                    return fail_with_rollback(
                        shell,
                        &fs,
                        req,
                        &service_name,
                        &config_path,
                        backup_path,
                        e,
                    )
                    .await;
                }
                *committed = true;
                sink.completed(STEP_VALIDATE, detail);
            }
            Err(e) => {
                let _ = fs.discard(&staging).await;
                sink.failed(STEP_VALIDATE, &e);
                // destination untouched, nothing to roll back
                return Err(e);
            }
        }
    }

    // reload
    if req.auto_restart {
        sink.running(STEP_RELOAD);
        match reload_service(shell, req, &service_name).await {
            Ok(detail) => sink.completed(STEP_RELOAD, detail),
            Err(e) => {
                sink.failed(STEP_RELOAD, &e);
                return fail_with_rollback(shell, &fs, req, &service_name, &config_path, backup_path, e)
                    .await;
            }
        }
    } else {
        sink.skipped(STEP_RELOAD);
    }

    // verify
    sink.running(STEP_VERIFY);
    match verify_service(shell, req, &service_name, &config_path).await {
        Ok(info) => {
            sink.completed(
                STEP_VERIFY,
                format!(
                    "status={} pid={}",
                    info.status,
                    info.pid.as_deref().unwrap_or("-")
                ),
            );
            Ok(info)
        }
        Err(e) => {
            sink.failed(STEP_VERIFY, &e);
            fail_with_rollback(shell, &fs, req, &service_name, &config_path, backup_path, e).await
        }
    }
}

async fn backup_existing(
    shell: &dyn CommandChannel,
    fs: &RemoteFs<'_>,
    req: &ConfigDeployRequest,
    target: &TargetSpec,
    config_path: &str,
) -> Result<Option<String>, ControlError> {
    if !fs.exists(config_path).await? {
        return Ok(None);
    }
    let backup = format!(
        "/tmp/{}_{}_{}.bak",
        req.component,
        target.host.id,
        backup_timestamp()
    );
    let output = shell
        .run_cmd(&format!(
            "sudo cp {} {}",
            shell_quote(config_path),
            shell_quote(&backup)
        ))
        .await?;
    if !output.success() {
        return Err(ControlError::CommandFailed(format!(
            "backup of {} failed: {}",
            config_path,
            output.stderr.trim()
        )));
    }
    Ok(Some(backup))
}

async fn stage_upload(fs: &RemoteFs<'_>, artifact: &Artifact) -> Result<String, ControlError> {
    if let Some(idx) = artifact.target_path.rfind('/') {
        if idx > 0 {
            fs.ensure_dir(&artifact.target_path[..idx], 0o755).await?;
        }
    }
    fs.stage(artifact).await
}

/// Upstream validator from the catalog; a generic YAML safe-load check for
/// components without one
async fn validate_staged(
    shell: &dyn CommandChannel,
    req: &ConfigDeployRequest,
    staging: &str,
) -> Result<String, ControlError> {
    let command = match catalog::global()
        .get(&req.component)
        .and_then(|spec| spec.validate_command.clone())
    {
        Some(template) => template.replace("{{config_path}}", &shell_quote(staging)),
        None => format!(
            "python3 -c \"import yaml; yaml.safe_load(open({}))\"",
            py_quote(staging)
        ),
    };

    debug!("validating staged config with: {}", command);
    let output = shell.run_cmd(&command).await?;
    if !output.success() {
        return Err(ControlError::ValidationFailed(output.stderr_tail(20)));
    }
    Ok("validator passed".to_string())
}

fn py_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "\\'"))
}

async fn reload_service(
    shell: &dyn CommandChannel,
    req: &ConfigDeployRequest,
    service_name: &str,
) -> Result<String, ControlError> {
    if let Some(endpoint) = &req.reload_endpoint {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let response = client
            .post(endpoint)
            .send()
            .await
            .map_err(|e| ControlError::ReloadFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ControlError::ReloadFailed(format!(
                "reload endpoint returned {}",
                response.status()
            )));
        }
        return Ok(format!("reloaded via {}", endpoint));
    }

    let output = shell
        .run_cmd(&format!("sudo systemctl restart {}", shell_quote(service_name)))
        .await?;
    if !output.success() {
        return Err(ControlError::ReloadFailed(output.stderr_tail(10)));
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    Ok(format!("restarted {}", service_name))
}

async fn verify_service(
    shell: &dyn CommandChannel,
    req: &ConfigDeployRequest,
    service_name: &str,
    config_path: &str,
) -> Result<ServiceInfo, ControlError> {
    let mut info = ServiceInfo::default();

    let running = probe::service_running(shell, service_name).await?;
    info.status = if running { "active" } else { "inactive" }.to_string();
    if req.auto_restart && !running {
        return Err(ControlError::CommandFailed(format!(
            "service {} is not running after reload",
            service_name
        )));
    }

    let pid = shell
        .run_cmd(&format!(
            "systemctl show -p MainPID {}",
            shell_quote(service_name)
        ))
        .await?;
    if pid.success() {
        if let Some(value) = pid.stdout_trimmed().strip_prefix("MainPID=") {
            if value != "0" && !value.is_empty() {
                info.pid = Some(value.to_string());
            }
        }
    }

    let banner = shell
        .run_cmd(&format!("{} --version 2>&1 | head -1", shell_quote(&req.component)))
        .await?;
    if banner.success() && !banner.stdout_trimmed().is_empty() {
        info.version_banner = Some(banner.stdout_trimmed().to_string());
    }

    let hash = shell
        .run_cmd(&format!("sha256sum {} | awk '{{print $1}}'", shell_quote(config_path)))
        .await?;
    if hash.success() && !hash.stdout_trimmed().is_empty() {
        info.config_sha256 = Some(hash.stdout_trimmed().to_string());
    }

    Ok(info)
}

/// Restore the backup and try one more reload before surfacing the failure
async fn fail_with_rollback(
    shell: &dyn CommandChannel,
    fs: &RemoteFs<'_>,
    req: &ConfigDeployRequest,
    service_name: &str,
    config_path: &str,
    backup_path: &Option<String>,
    original: ControlError,
) -> Result<ServiceInfo, ControlError> {
    if let Some(backup) = backup_path {
        warn!(
            "deployment step failed ({}), restoring {} from {}",
            original, config_path, backup
        );
        if let Err(e) = fs.restore_file(backup, config_path).await {
            warn!("rollback restore failed: {}", e);
        } else if req.auto_restart {
            if let Err(e) = reload_service(shell, req, service_name).await {
                warn!("rollback reload failed: {}", e);
            }
        }
    }
    Err(original)
}

#[cfg(test)]
mod tests;
