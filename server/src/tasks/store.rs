//! Task store abstraction
//!
//! Tasks persist as JSON under `task:{id}` keys with a TTL applied once the
//! task is terminal. The trait is narrow so a KV server, an embedded store,
//! or a relational table can back it; the in-memory implementation serves
//! tests and single-node deployments.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::errors::ControlError;

pub const TASK_KEY_PREFIX: &str = "task:";

/// Terminal tasks are kept for 24 hours
pub const TERMINAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Key-value store with TTL for durable task snapshots
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), ControlError>;

    async fn get(&self, key: &str) -> Result<Option<String>, ControlError>;

    async fn delete(&self, key: &str) -> Result<(), ControlError>;

    /// All live values whose key starts with `prefix`
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, ControlError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// In-memory task store
#[derive(Default)]
pub struct MemoryTaskStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), ControlError> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.live());
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ControlError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), ControlError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, ControlError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live())
            .map(|(_, e)| e.value.clone())
            .collect())
    }
}

#[derive(Serialize, Deserialize)]
struct FileEnvelope {
    key: String,
    /// Unix seconds; entries past this moment are treated as gone
    expires_at: Option<u64>,
    value: String,
}

impl FileEnvelope {
    fn live(&self) -> bool {
        match self.expires_at {
            None => true,
            Some(at) => now_unix() < at,
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Task store backed by one JSON file per key under a local state
/// directory, so task records survive a control-plane restart.
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ControlError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys contain ':'; keep filenames portable
        self.dir.join(format!("{}.json", key.replace(':', "_")))
    }

    async fn read_envelope(&self, path: &PathBuf) -> Option<FileEnvelope> {
        let bytes = fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), ControlError> {
        let envelope = FileEnvelope {
            key: key.to_string(),
            expires_at: ttl.map(|ttl| now_unix() + ttl.as_secs()),
            value,
        };
        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec(&envelope)?).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ControlError> {
        let path = self.path_for(key);
        match self.read_envelope(&path).await {
            Some(envelope) if envelope.live() => Ok(Some(envelope.value)),
            Some(_) => {
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ControlError> {
        let _ = fs::remove_file(self.path_for(key)).await;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, ControlError> {
        let mut values = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(envelope) = self.read_envelope(&path).await {
                    if envelope.key.starts_with(prefix) && envelope.live() {
                        values.push(envelope.value);
                    }
                }
            }
        }
        Ok(values)
    }
}
