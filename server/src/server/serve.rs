//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::ControlError;
use crate::server::handlers::{
    cancel_task_handler, create_config_deployment_handler, create_install_task_handler,
    create_upgrade_task_handler, execute_task_handler, get_task_handler, health_handler,
    list_hosts_handler, list_tasks_handler, probe_component_handler, register_host_handler,
    ssh_execute_handler, ssh_test_handler, version_handler,
};
use crate::server::state::ServerState;

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ControlError>>, ControlError> {
    let app = Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Inventory
        .route("/hosts", get(list_hosts_handler).post(register_host_handler))
        .route(
            "/hosts/:id/components/:component/presence",
            get(probe_component_handler),
        )
        // Install / upgrade tasks
        .route("/deploy/tasks", post(create_install_task_handler))
        .route("/upgrade/tasks", post(create_upgrade_task_handler))
        .route("/upgrade/tasks/:id", get(get_task_handler))
        .route("/upgrade/tasks/:id/execute", post(execute_task_handler))
        .route("/upgrade/tasks/:id/cancel", post(cancel_task_handler))
        .route("/tasks", get(list_tasks_handler))
        // Config deployment
        .route(
            "/config-deployment/tasks",
            post(create_config_deployment_handler),
        )
        // Ad-hoc SSH
        .route("/ssh/test", post(ssh_test_handler))
        .route("/ssh/execute", post(ssh_execute_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ControlError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ControlError::ServerError(e.to_string()))
    });

    Ok(handle)
}
