//! HTTP request handlers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::catalog;
use crate::errors::ControlError;
use crate::inventory::{Credential, Host};
use crate::lifecycle;
use crate::pipeline::{self, ConfigDeployRequest, TargetSpec};
use crate::render::{self, ArtifactKind, Variables};
use crate::server::state::ServerState;
use crate::ssh::shell::RunRequest;
use crate::ssh::transport::Connection;
use crate::tasks::{Task, TaskKind, TaskStatus, UpgradeStrategy};
use crate::utils::{generate_task_id, sha256_hash, version_info};

/// JSON error envelope with a status code per error kind
pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::TemplateUnresolved(_)
            | ControlError::ValidationFailed(_)
            | ControlError::ConfigError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------- health ---------------------------------- //

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "monplane".to_string(),
        version: version_info().version,
    })
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ---------------------------- inventory -------------------------------- //

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterHostRequest {
    pub id: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub pinned_host_key: Option<String>,
}

fn default_port() -> u16 {
    22
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterHostResponse {
    pub id: String,
}

fn credential_from(
    password: Option<String>,
    private_key: Option<String>,
    passphrase: Option<String>,
) -> Result<Credential, ApiError> {
    match (password, private_key) {
        (_, Some(key_pem)) => Ok(Credential::PrivateKey {
            key_pem,
            passphrase,
        }),
        (Some(password), None) => Ok(Credential::Password { password }),
        (None, None) => Err(ApiError(ControlError::ConfigError(
            "either password or privateKey is required".to_string(),
        ))),
    }
}

pub async fn register_host_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<RegisterHostRequest>,
) -> ApiResult<Json<RegisterHostResponse>> {
    let credential = credential_from(req.password, req.private_key, req.passphrase)?;
    let id = req
        .id
        .unwrap_or_else(|| format!("host_{}", uuid::Uuid::new_v4().simple()));
    let host = Host {
        id: id.clone(),
        addr: req.host,
        port: req.port,
        username: req.username,
        credential,
        pinned_host_key: req.pinned_host_key,
    };
    state.inventory.add_host(host).await;
    Ok(Json(RegisterHostResponse { id }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSummary {
    pub id: String,
    pub addr: String,
    pub port: u16,
    pub username: String,
}

pub async fn list_hosts_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<Vec<HostSummary>>> {
    use crate::inventory::Inventory;
    let mut hosts: Vec<HostSummary> = state
        .inventory
        .list_hosts()
        .await?
        .into_iter()
        .map(|h| HostSummary {
            id: h.id,
            addr: h.addr,
            port: h.port,
            username: h.username,
        })
        .collect();
    hosts.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(hosts))
}

// ----------------------------- probing ---------------------------------- //

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeQuery {
    pub target_version: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResponse {
    pub presence: crate::probe::Presence,
    pub recommended_action: crate::probe::RecommendedAction,
}

/// Live-probe one component on one host and record the observation
pub async fn probe_component_handler(
    State(state): State<Arc<ServerState>>,
    Path((host_id, component)): Path<(String, String)>,
    Query(query): Query<ProbeQuery>,
) -> ApiResult<Json<ProbeResponse>> {
    use crate::inventory::Inventory;

    let host = state.inventory.get_host(&host_id).await?;
    let spec = catalog::global().spec_or_fallback(&component);

    let session = state.pool.acquire(&host).await?;
    let report = crate::probe::probe(&session, &spec, query.target_version.as_deref()).await?;

    state
        .inventory
        .put_presence(&host_id, &component, report.presence.clone())
        .await?;

    Ok(Json(ProbeResponse {
        presence: report.presence,
        recommended_action: report.action,
    }))
}

// ---------------------------- upgrade tasks ----------------------------- //

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUpgradeTaskRequest {
    pub host_id: String,
    pub component_name: String,
    pub from_version: String,
    pub to_version: String,
    #[serde(default)]
    pub strategy: Option<UpgradeStrategy>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreatedResponse {
    pub task_id: String,
}

pub async fn create_upgrade_task_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<CreateUpgradeTaskRequest>,
) -> ApiResult<Json<TaskCreatedResponse>> {
    use crate::inventory::Inventory;
    state.inventory.get_host(&req.host_id).await?;

    let strategy = req.strategy.unwrap_or_default();
    let mut task = Task::new(
        generate_task_id("upgrade"),
        TaskKind::UpgradeComponent,
        req.host_id,
        req.component_name,
    );
    task.from_version = Some(req.from_version);
    task.to_version = Some(req.to_version);
    task.steps = lifecycle::build_steps(TaskKind::UpgradeComponent, &strategy);
    task.strategy = Some(strategy);

    state.manager.create(&task).await?;
    Ok(Json(TaskCreatedResponse { task_id: task.id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstallTaskRequest {
    pub host_id: String,
    pub component_name: String,
    pub version: String,
    #[serde(default)]
    pub strategy: Option<UpgradeStrategy>,
}

pub async fn create_install_task_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<CreateInstallTaskRequest>,
) -> ApiResult<Json<TaskCreatedResponse>> {
    use crate::inventory::Inventory;
    state.inventory.get_host(&req.host_id).await?;

    let strategy = req.strategy.unwrap_or_default();
    let mut task = Task::new(
        generate_task_id("deploy"),
        TaskKind::DeployComponent,
        req.host_id,
        req.component_name,
    );
    task.to_version = Some(req.version);
    task.steps = lifecycle::build_steps(TaskKind::DeployComponent, &strategy);
    task.strategy = Some(strategy);

    state.manager.create(&task).await?;
    Ok(Json(TaskCreatedResponse { task_id: task.id }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub accepted: bool,
}

/// Start a created install/upgrade task asynchronously. The conflict check
/// happens here, before any remote command runs.
pub async fn execute_task_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AcceptedResponse>> {
    use crate::inventory::Inventory;

    let task = state.manager.get(&id).await?;
    let host = state.inventory.get_host(&task.host_id).await?;
    let spec = catalog::global().spec_or_fallback(&task.component);

    let handle = state.manager.start(&id).await?;
    let pool = state.pool.clone();
    tokio::spawn(async move {
        let session = match pool.acquire(&host).await {
            Ok(session) => session,
            Err(e) => {
                let _ = handle
                    .finish(TaskStatus::Failed, Some(e.to_string()))
                    .await;
                return;
            }
        };
        if let Err(e) = lifecycle::execute(handle, &session, &spec).await {
            error!("task {} did not persist cleanly: {}", id, e);
        }
    });

    Ok(Json(AcceptedResponse { accepted: true }))
}

pub async fn get_task_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.manager.get(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<TaskStatus>,
}

pub async fn list_tasks_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.manager.list_by_status(query.status).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub status: TaskStatus,
}

pub async fn cancel_task_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let status = state.manager.cancel(&id).await?;
    Ok(Json(CancelResponse { status }))
}

// ------------------------- config deployment ---------------------------- //

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployTargetRequest {
    pub host_id: String,
    pub service_name: Option<String>,
    pub config_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConfigDeploymentRequest {
    pub targets: Vec<DeployTargetRequest>,
    pub component_name: String,
    /// Variables for the component's config template
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Raw config content, bypassing the template catalog
    pub content: Option<String>,
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default = "default_true")]
    pub backup: bool,
    #[serde(default)]
    pub auto_restart: bool,
    pub reload_endpoint: Option<String>,
}

fn default_true() -> bool {
    true
}

pub async fn create_config_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<CreateConfigDeploymentRequest>,
) -> ApiResult<Json<TaskCreatedResponse>> {
    use crate::inventory::Inventory;

    if req.targets.is_empty() {
        return Err(ApiError(ControlError::ConfigError(
            "at least one target is required".to_string(),
        )));
    }

    let mut targets = Vec::with_capacity(req.targets.len());
    for t in &req.targets {
        let host = state.inventory.get_host(&t.host_id).await?;
        targets.push(TargetSpec {
            host,
            service_name: t.service_name.clone(),
            config_path: t.config_path.clone(),
        });
    }

    let spec = catalog::global().spec_or_fallback(&req.component_name);

    // An unresolvable template fails the task at creation time
    let artifact = match &req.content {
        Some(content) => {
            let target_path = req
                .targets
                .first()
                .and_then(|t| t.config_path.clone())
                .or_else(|| spec.config_paths.first().cloned())
                .ok_or_else(|| {
                    ControlError::ConfigError(format!(
                        "no config path known for {}",
                        req.component_name
                    ))
                })?;
            render::Artifact {
                target_path,
                content: content.clone(),
                mode: 0o644,
                owner_user: None,
                owner_group: None,
            }
        }
        None => {
            let mut vars: Variables = req.variables.clone();
            if let Some(endpoint) = &state.remote_endpoint {
                vars.entry("remote_endpoint".to_string())
                    .or_insert_with(|| Value::from(endpoint.clone()));
                vars.entry("remote_write_url".to_string())
                    .or_insert_with(|| Value::from(endpoint.clone()));
            }
            render::render_artifact(&spec, ArtifactKind::ConfigFile, &vars)?
        }
    };

    let deploy = ConfigDeployRequest {
        component: req.component_name.clone(),
        artifact: artifact.clone(),
        validate: req.validate,
        backup: req.backup,
        auto_restart: req.auto_restart,
        reload_endpoint: req.reload_endpoint.clone(),
    };

    let host_ids: Vec<String> = targets.iter().map(|t| t.host.id.clone()).collect();
    let mut task = Task::new(
        generate_task_id("config"),
        TaskKind::DeployConfig,
        host_ids.join(","),
        req.component_name.clone(),
    );
    task.config_fingerprint = Some(sha256_hash(artifact.content.as_bytes()));
    task.steps = if targets.len() == 1 {
        pipeline::build_steps(&deploy)
    } else {
        pipeline::build_target_steps(&targets)
    };

    state.manager.create(&task).await?;
    let task_id = task.id.clone();

    let handle = state.manager.start(&task.id).await?;
    let sessions: Arc<dyn crate::ssh::SessionSource> = state.pool.clone();
    let fanout = state.fanout.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline::execute(handle, sessions, fanout, deploy, targets).await {
            error!("config deployment {} did not persist cleanly: {}", task_id, e);
        }
    });

    Ok(Json(TaskCreatedResponse { task_id: task.id }))
}

// ------------------------------ ad-hoc SSH ------------------------------ //

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshAuthRequest {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl SshAuthRequest {
    fn into_host(self) -> Result<Host, ApiError> {
        let credential = credential_from(self.password, self.private_key, self.passphrase)?;
        Ok(Host {
            id: format!("adhoc_{}", self.host),
            addr: self.host,
            port: self.port,
            username: self.username,
            credential,
            pinned_host_key: None,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshTestResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn ssh_test_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<SshAuthRequest>,
) -> ApiResult<Json<SshTestResponse>> {
    let auth_method = if req.private_key.is_some() {
        "key"
    } else {
        "password"
    };
    let host = req.into_host()?;

    let conn = match Connection::dial(&host, state.pool.options().dial_timeout).await {
        Ok(conn) => conn,
        Err(e) => {
            return Ok(Json(SshTestResponse {
                success: false,
                details: None,
                error: Some(e.to_string()),
            }))
        }
    };

    let result = conn
        .exec(&RunRequest::new("echo 'connection test'"))
        .await;
    conn.close().await;

    match result {
        Ok(output) if output.success() => Ok(Json(SshTestResponse {
            success: true,
            details: Some(serde_json::json!({
                "host": host.addr,
                "port": host.port,
                "username": host.username,
                "authMethod": auth_method,
                "connectedAt": Utc::now().to_rfc3339(),
            })),
            error: None,
        })),
        Ok(output) => Ok(Json(SshTestResponse {
            success: false,
            details: None,
            error: Some(format!(
                "connection established but command failed: {}",
                output.stderr.trim()
            )),
        })),
        Err(e) => Ok(Json(SshTestResponse {
            success: false,
            details: None,
            error: Some(e.to_string()),
        })),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshExecuteRequest {
    #[serde(flatten)]
    pub auth: SshAuthRequest,
    pub command: String,
    pub stdin: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshExecuteResponse {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
}

pub async fn ssh_execute_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<SshExecuteRequest>,
) -> ApiResult<Json<SshExecuteResponse>> {
    let host = req.auth.into_host()?;

    let conn = match Connection::dial(&host, state.pool.options().dial_timeout).await {
        Ok(conn) => conn,
        Err(e) => {
            return Ok(Json(SshExecuteResponse {
                success: false,
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: 1,
                elapsed_ms: 0,
            }))
        }
    };

    let mut run = RunRequest::new(req.command);
    if let Some(stdin) = req.stdin {
        run = run.with_stdin(stdin);
    }
    if let Some(secs) = req.timeout_secs {
        run = run.with_timeout(Duration::from_secs(secs));
    }

    let result = conn.exec(&run).await;
    conn.close().await;

    match result {
        Ok(output) => Ok(Json(SshExecuteResponse {
            success: output.success(),
            exit_code: output.exit_code,
            elapsed_ms: output.elapsed.as_millis() as u64,
            stdout: output.stdout,
            stderr: output.stderr,
        })),
        Err(e) => Ok(Json(SshExecuteResponse {
            success: false,
            stdout: String::new(),
            stderr: e.to_string(),
            exit_code: 1,
            elapsed_ms: 0,
        })),
    }
}
