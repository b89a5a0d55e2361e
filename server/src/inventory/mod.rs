//! Host inventory and credential handling

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::ControlError;
use crate::probe::Presence;
use crate::utils::sha256_hash;

/// Authentication material for a host. Secrets are never logged and never
/// serialized into task records; tasks carry only the host ID.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Credential {
    Password {
        password: String,
    },
    PrivateKey {
        key_pem: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl Credential {
    /// Stable fingerprint of the secret material, usable as a pool key
    /// component without exposing the secret itself.
    pub fn fingerprint(&self) -> String {
        match self {
            Credential::Password { password } => sha256_hash(password.as_bytes()),
            Credential::PrivateKey { key_pem, .. } => sha256_hash(key_pem.as_bytes()),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password { .. } => write!(f, "Credential::Password(<redacted>)"),
            Credential::PrivateKey { .. } => write!(f, "Credential::PrivateKey(<redacted>)"),
        }
    }
}

/// A remote Unix endpoint. Hosts are created by inventory and never mutated
/// while a task referencing them is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Stable inventory ID
    pub id: String,

    /// Hostname or IP address
    pub addr: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Login user
    pub username: String,

    /// Authentication material
    #[serde(skip_serializing)]
    pub credential: Credential,

    /// Optional pinned SHA-256 host key fingerprint. When set, a key
    /// mismatch on dial fails authentication.
    #[serde(default)]
    pub pinned_host_key: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Narrow interface over the relational host inventory
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn get_host(&self, id: &str) -> Result<Host, ControlError>;

    async fn list_hosts(&self) -> Result<Vec<Host>, ControlError>;

    /// Record the latest observed presence of a component on a host
    async fn put_presence(
        &self,
        host_id: &str,
        component: &str,
        presence: Presence,
    ) -> Result<(), ControlError>;
}

/// In-memory inventory, used by tests and single-node deployments
#[derive(Default)]
pub struct MemoryInventory {
    hosts: RwLock<HashMap<String, Host>>,
    presence: RwLock<HashMap<(String, String), Presence>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_host(&self, host: Host) {
        self.hosts.write().await.insert(host.id.clone(), host);
    }

    pub async fn get_presence(&self, host_id: &str, component: &str) -> Option<Presence> {
        self.presence
            .read()
            .await
            .get(&(host_id.to_string(), component.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn get_host(&self, id: &str) -> Result<Host, ControlError> {
        self.hosts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(format!("host {}", id)))
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, ControlError> {
        Ok(self.hosts.read().await.values().cloned().collect())
    }

    async fn put_presence(
        &self,
        host_id: &str,
        component: &str,
        presence: Presence,
    ) -> Result<(), ControlError> {
        self.presence
            .write()
            .await
            .insert((host_id.to_string(), component.to_string()), presence);
        Ok(())
    }
}
