//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::app::state::AppState;
use crate::errors::ControlError;
use crate::server::serve::serve;
use crate::server::state::ServerState;

const MAX_SHUTDOWN_DELAY: Duration = Duration::from_secs(30);

/// Run the control plane until the shutdown signal fires
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ControlError> {
    info!("Initializing monplane control plane...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let app_state = AppState::init(&options).await?;

    let server_state = ServerState::new(
        app_state.manager.clone(),
        app_state.pool.clone(),
        app_state.inventory.clone(),
        options.fanout.clone(),
        options.remote_endpoint.clone(),
    );

    let mut server_shutdown = shutdown_tx.subscribe();
    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = server_shutdown.recv().await;
    })
    .await?;

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    let _ = shutdown_tx.send(());
    shutdown(server_handle, app_state).await
}

async fn shutdown(
    server_handle: JoinHandle<Result<(), ControlError>>,
    app_state: Arc<AppState>,
) -> Result<(), ControlError> {
    let result = tokio::time::timeout(MAX_SHUTDOWN_DELAY, async {
        server_handle
            .await
            .map_err(|e| ControlError::ShutdownError(e.to_string()))??;
        app_state.pool.close_all().await;
        Ok::<(), ControlError>(())
    })
    .await;

    match result {
        Ok(inner) => {
            info!("Shutdown complete");
            inner
        }
        Err(_) => {
            error!("Shutdown timed out after {:?}", MAX_SHUTDOWN_DELAY);
            Err(ControlError::ShutdownError("shutdown timed out".to_string()))
        }
    }
}
