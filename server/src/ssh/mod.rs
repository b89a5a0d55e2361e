//! SSH connectivity: pooled authenticated clients and the remote shell
//! primitive every other subsystem runs on

pub mod pool;
pub mod shell;
pub mod transport;

use async_trait::async_trait;

use crate::errors::ControlError;
use crate::inventory::Host;

pub use pool::{PoolOptions, PooledSession, SessionPool};
pub use shell::{CommandChannel, CommandOutput, RunRequest};

/// Anything that can hand out a command channel to a host. Backed by the
/// session pool in production.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn CommandChannel>, ControlError>;
}

#[async_trait]
impl SessionSource for SessionPool {
    async fn connect(&self, host: &Host) -> Result<Box<dyn CommandChannel>, ControlError> {
        Ok(Box::new(self.acquire(host).await?))
    }
}
