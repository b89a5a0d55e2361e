//! SSH session pool
//!
//! Clients are keyed by (host, port, user, credential fingerprint) and
//! reused across tasks. The pool is the only shared mutable state in the
//! system; a session guard's release is guaranteed on every exit path by
//! its drop impl.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::errors::ControlError;
use crate::inventory::Host;
use crate::ssh::shell::{CommandChannel, CommandOutput, RunRequest};
use crate::ssh::transport::Connection;

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Bounded dial deadline
    pub dial_timeout: Duration,

    /// Default per-command deadline when a request carries none
    pub session_timeout: Duration,

    /// Idle clients are evicted after this long without use
    pub idle_ttl: Duration,

    /// Concurrent session cap per pooled client
    pub max_sessions_per_host: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(30),
            idle_ttl: Duration::from_secs(300),
            max_sessions_per_host: 3,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct PoolKey {
    addr: String,
    port: u16,
    username: String,
    credential: String,
}

impl PoolKey {
    fn for_host(host: &Host) -> Self {
        Self {
            addr: host.addr.clone(),
            port: host.port,
            username: host.username.clone(),
            credential: host.credential.fingerprint(),
        }
    }
}

struct PoolEntry {
    conn: Arc<Connection>,
    sessions: Arc<Semaphore>,
    last_used: Instant,
}

/// Shared pool of authenticated SSH clients
pub struct SessionPool {
    options: PoolOptions,
    entries: Mutex<HashMap<PoolKey, PoolEntry>>,
}

impl SessionPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Acquire a session slot on a pooled client for `host`, dialing a new
    /// connection when none is alive. Waits when the per-host session cap
    /// is exhausted.
    pub async fn acquire(&self, host: &Host) -> Result<PooledSession, ControlError> {
        let key = PoolKey::for_host(host);

        let reusable = {
            let mut entries = self.entries.lock().await;
            self.evict_stale(&mut entries);
            entries.get_mut(&key).map(|entry| {
                entry.last_used = Instant::now();
                (entry.conn.clone(), entry.sessions.clone())
            })
        };

        let (conn, sessions) = match reusable {
            Some(pair) => pair,
            None => {
                // Dial outside the lock so an unreachable host cannot stall
                // acquisitions for other hosts.
                let conn = Arc::new(Connection::dial(host, self.options.dial_timeout).await?);
                let sessions = Arc::new(Semaphore::new(self.options.max_sessions_per_host));
                let mut entries = self.entries.lock().await;
                match entries.get_mut(&key) {
                    // Another worker dialed the same host meanwhile; keep
                    // the pooled one and drop ours.
                    Some(existing) if !existing.conn.is_closed() => {
                        let pair = (existing.conn.clone(), existing.sessions.clone());
                        let late = conn;
                        tokio::spawn(async move { late.close().await });
                        pair
                    }
                    _ => {
                        entries.insert(
                            key.clone(),
                            PoolEntry {
                                conn: conn.clone(),
                                sessions: sessions.clone(),
                                last_used: Instant::now(),
                            },
                        );
                        (conn, sessions)
                    }
                }
            }
        };

        let permit = sessions
            .acquire_owned()
            .await
            .map_err(|_| ControlError::SessionFailed("session pool closed".to_string()))?;

        Ok(PooledSession {
            conn,
            _permit: permit,
            default_timeout: self.options.session_timeout,
        })
    }

    /// Drop the pooled client for a host, closing its connection
    pub async fn close(&self, host: &Host) {
        let key = PoolKey::for_host(host);
        let entry = self.entries.lock().await.remove(&key);
        if let Some(entry) = entry {
            debug!("closing pooled SSH client for {}", entry.conn.remote());
            entry.conn.close().await;
        }
    }

    /// Close every pooled client (shutdown path)
    pub async fn close_all(&self) {
        let drained: Vec<PoolEntry> = self.entries.lock().await.drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.conn.close().await;
        }
    }

    fn evict_stale(&self, entries: &mut HashMap<PoolKey, PoolEntry>) {
        let idle_ttl = self.options.idle_ttl;
        entries.retain(|_, entry| {
            let keep = !entry.conn.is_closed() && entry.last_used.elapsed() < idle_ttl;
            if !keep {
                let conn = entry.conn.clone();
                tokio::spawn(async move { conn.close().await });
            }
            keep
        });
    }
}

/// One session slot on a pooled client. Dropping it releases the slot.
pub struct PooledSession {
    conn: Arc<Connection>,
    _permit: OwnedSemaphorePermit,
    default_timeout: Duration,
}

impl PooledSession {
    pub fn remote(&self) -> &str {
        self.conn.remote()
    }
}

#[async_trait]
impl CommandChannel for PooledSession {
    async fn run(&self, mut req: RunRequest) -> Result<CommandOutput, ControlError> {
        if req.timeout.is_none() {
            req.timeout = Some(self.default_timeout);
        }
        self.conn.exec(&req).await
    }
}
