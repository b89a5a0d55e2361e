//! Shared server state

use std::sync::Arc;

use crate::fanout::FanoutOptions;
use crate::inventory::MemoryInventory;
use crate::ssh::pool::SessionPool;
use crate::tasks::TaskManager;

/// State shared by all request handlers
pub struct ServerState {
    pub manager: Arc<TaskManager>,
    pub pool: Arc<SessionPool>,
    pub inventory: Arc<MemoryInventory>,
    pub fanout: FanoutOptions,
    /// Default reload endpoint substituted into config deployments
    pub remote_endpoint: Option<String>,
}

impl ServerState {
    pub fn new(
        manager: Arc<TaskManager>,
        pool: Arc<SessionPool>,
        inventory: Arc<MemoryInventory>,
        fanout: FanoutOptions,
        remote_endpoint: Option<String>,
    ) -> Self {
        Self {
            manager,
            pool,
            inventory,
            fanout,
            remote_endpoint,
        }
    }
}
