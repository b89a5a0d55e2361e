//! Application state wiring

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::errors::ControlError;
use crate::inventory::MemoryInventory;
use crate::ssh::pool::SessionPool;
use crate::tasks::{FileTaskStore, MemoryTaskStore, TaskManager, TaskStore};

/// Long-lived application state
pub struct AppState {
    pub manager: Arc<TaskManager>,
    pub pool: Arc<SessionPool>,
    pub inventory: Arc<MemoryInventory>,
}

impl AppState {
    /// Build the shared state and fail any task a previous process left
    /// running; remote state under a dead worker is unknown.
    pub async fn init(options: &AppOptions) -> Result<Arc<Self>, ControlError> {
        let store: Arc<dyn TaskStore> = match &options.state_dir {
            Some(dir) => {
                info!("persisting task records under {}", dir.display());
                Arc::new(FileTaskStore::open(dir.clone()).await?)
            }
            None => Arc::new(MemoryTaskStore::new()),
        };

        let manager = Arc::new(TaskManager::new(store));
        manager.sweep_orphans().await?;

        Ok(Arc::new(Self {
            manager,
            pool: Arc::new(SessionPool::new(options.pool.clone())),
            inventory: Arc::new(MemoryInventory::new()),
        }))
    }
}
