//! Task orchestration
//!
//! The manager owns durable task records: it assigns IDs, persists a
//! snapshot after every step transition and log append, enforces the
//! one-upgrade-per-(host, component) rule, carries cooperative cancel
//! flags, and fails orphaned tasks at startup.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::errors::ControlError;
use crate::tasks::store::{TaskStore, TASK_KEY_PREFIX, TERMINAL_TTL};
use crate::tasks::{Task, TaskKind, TaskStatus};

/// Cooperative cancellation flag, consulted between steps
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type ClaimKey = (String, String);

/// Exclusive claim on (host, component); released on drop so a panicking
/// worker cannot wedge the pair.
pub struct RunningClaim {
    set: Arc<Mutex<HashSet<ClaimKey>>>,
    key: ClaimKey,
}

impl Drop for RunningClaim {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

/// Owner of durable task records
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    running: Arc<Mutex<HashSet<ClaimKey>>>,
    cancels: Mutex<HashMap<String, CancelFlag>>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            running: Arc::new(Mutex::new(HashSet::new())),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    fn key(id: &str) -> String {
        format!("{}{}", TASK_KEY_PREFIX, id)
    }

    /// Persist a snapshot. Terminal tasks pick up the retention TTL.
    pub async fn save(&self, task: &Task) -> Result<(), ControlError> {
        let ttl = task.is_terminal().then_some(TERMINAL_TTL);
        let json = serde_json::to_string(task)?;
        self.store.put(&Self::key(&task.id), json, ttl).await?;
        if task.is_terminal() {
            self.cancels.lock().expect("cancel map").remove(&task.id);
        }
        Ok(())
    }

    /// Persist a brand-new task record
    pub async fn create(&self, task: &Task) -> Result<(), ControlError> {
        self.save(task).await
    }

    pub async fn get(&self, id: &str) -> Result<Task, ControlError> {
        let json = self
            .store
            .get(&Self::key(id))
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("task {}", id)))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub async fn list_by_status(
        &self,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, ControlError> {
        let mut tasks = Vec::new();
        for json in self.store.scan(TASK_KEY_PREFIX).await? {
            match serde_json::from_str::<Task>(&json) {
                Ok(task) => {
                    if status.map(|s| task.status == s).unwrap_or(true) {
                        tasks.push(task);
                    }
                }
                Err(e) => warn!("skipping undecodable task record: {}", e),
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    /// Cooperative cancel. A pending task is terminally canceled right
    /// away; a running one is flagged and its worker stops between steps.
    /// Canceling a terminal task is a no-op.
    pub async fn cancel(&self, id: &str) -> Result<TaskStatus, ControlError> {
        let mut task = self.get(id).await?;
        if task.is_terminal() {
            return Ok(task.status);
        }
        if task.status == TaskStatus::Pending {
            task.finish(TaskStatus::Canceled, Some("canceled by operator".to_string()));
            self.save(&task).await?;
            return Ok(task.status);
        }
        self.cancel_flag(id).cancel();
        Ok(task.status)
    }

    /// Flag shared between the API and the worker executing the task
    pub fn cancel_flag(&self, id: &str) -> CancelFlag {
        self.cancels
            .lock()
            .expect("cancel map")
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Claim mutual exclusion for an upgrade on (host, component)
    pub fn claim(&self, host_id: &str, component: &str) -> Result<RunningClaim, ControlError> {
        let key = (host_id.to_string(), component.to_string());
        let mut set = self.running.lock().expect("running set");
        if !set.insert(key.clone()) {
            return Err(ControlError::Conflict(format!(
                "an upgrade of {} on host {} is already running",
                component, host_id
            )));
        }
        Ok(RunningClaim {
            set: self.running.clone(),
            key,
        })
    }

    /// Load a task and move it to running, claiming mutual exclusion for
    /// mutating kinds. Fails `Conflict` when the pair is already claimed
    /// before any remote command runs.
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<TaskHandle, ControlError> {
        let mut task = self.get(id).await?;
        if task.status != TaskStatus::Pending {
            return Err(ControlError::Conflict(format!(
                "task {} is {:?}, not pending",
                id, task.status
            )));
        }

        let claim = match task.kind {
            TaskKind::UpgradeComponent | TaskKind::DeployComponent => {
                Some(self.claim(&task.host_id, &task.component)?)
            }
            TaskKind::DeployConfig => None,
        };

        task.begin();
        self.save(&task).await?;

        Ok(TaskHandle {
            manager: self.clone(),
            cancel: self.cancel_flag(id),
            task,
            _claim: claim,
        })
    }

    /// Fail every task left `running` by a previous process. Remote state
    /// under a dead worker is unknown, so nothing is resumed.
    pub async fn sweep_orphans(&self) -> Result<usize, ControlError> {
        let mut swept = 0;
        for mut task in self.list_by_status(Some(TaskStatus::Running)).await? {
            task.append_log("task orphaned by control plane restart");
            task.finish(TaskStatus::Failed, Some(ControlError::Orphaned.to_string()));
            self.save(&task).await?;
            swept += 1;
        }
        if swept > 0 {
            info!("failed {} orphaned task(s) from a previous run", swept);
        }
        Ok(swept)
    }
}

/// A running task owned by one worker. Every mutation persists a snapshot,
/// so a crash leaves the record at the last completed transition.
pub struct TaskHandle {
    manager: Arc<TaskManager>,
    pub task: Task,
    cancel: CancelFlag,
    _claim: Option<RunningClaim>,
}

impl TaskHandle {
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn persist(&self) -> Result<(), ControlError> {
        self.manager.save(&self.task).await
    }

    pub async fn log(&mut self, message: impl AsRef<str>) -> Result<(), ControlError> {
        self.task.append_log(message);
        self.persist().await
    }

    pub async fn step_running(&mut self, name: &str) -> Result<(), ControlError> {
        self.task.mark_step_running(name);
        self.persist().await
    }

    pub async fn step_completed(
        &mut self,
        name: &str,
        stdout_tail: String,
    ) -> Result<(), ControlError> {
        self.task.mark_step_completed(name, stdout_tail);
        self.persist().await
    }

    pub async fn step_failed(&mut self, name: &str, error: String) -> Result<(), ControlError> {
        self.task.mark_step_failed(name, error);
        self.persist().await
    }

    pub async fn step_skipped(&mut self, name: &str) -> Result<(), ControlError> {
        self.task.mark_step_skipped(name);
        self.persist().await
    }

    /// Terminal transition; consumes the handle and releases the claim
    pub async fn finish(
        mut self,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task, ControlError> {
        self.task.finish(status, error);
        self.persist().await?;
        Ok(self.task)
    }
}
