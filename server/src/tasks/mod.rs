//! Durable task records

pub mod orchestrator;
pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use orchestrator::{CancelFlag, TaskHandle, TaskManager};
pub use store::{FileTaskStore, MemoryTaskStore, TaskStore, TASK_KEY_PREFIX, TERMINAL_TTL};

/// Log buffer caps: whichever is hit first wins
pub const LOG_MAX_LINES: usize = 10_000;
pub const LOG_MAX_BYTES: usize = 1024 * 1024;
pub const LOG_DROP_MARKER: &str = "[earlier log entries dropped]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    DeployComponent,
    UpgradeComponent,
    DeployConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::RolledBack
                | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One cell of a task's state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub description: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stdout_tail: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            stdout_tail: String::new(),
            error: None,
        }
    }
}

/// Knobs for a component upgrade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    #[serde(default = "default_true")]
    pub backup_config: bool,

    #[serde(default)]
    pub backup_data: bool,

    #[serde(default = "default_true")]
    pub stop_before_switch: bool,

    #[serde(default)]
    pub migrate_config: bool,

    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    /// Overall upgrade deadline in seconds; 0 means no deadline
    #[serde(default = "default_upgrade_timeout")]
    pub upgrade_timeout_secs: u64,

    /// Settle time before the health check runs
    #[serde(default = "default_health_delay")]
    pub health_check_delay_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_upgrade_timeout() -> u64 {
    600
}

fn default_health_delay() -> u64 {
    5
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            backup_config: true,
            backup_data: false,
            stop_before_switch: true,
            migrate_config: false,
            rollback_on_failure: true,
            upgrade_timeout_secs: 600,
            health_check_delay_secs: 5,
        }
    }
}

/// Append-only, capped log. Older entries are dropped behind a marker once
/// either cap is reached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogBuffer {
    lines: Vec<String>,
    bytes: usize,
    dropped: bool,
}

impl LogBuffer {
    pub fn append(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push(line);
        while self.lines.len() > LOG_MAX_LINES || self.bytes > LOG_MAX_BYTES {
            if self.lines.is_empty() {
                break;
            }
            let evicted = self.lines.remove(0);
            self.bytes -= evicted.len();
            self.dropped = true;
        }
        if self.dropped && self.lines.first().map(String::as_str) != Some(LOG_DROP_MARKER) {
            self.lines.insert(0, LOG_DROP_MARKER.to_string());
            self.bytes += LOG_DROP_MARKER.len();
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn tail(&self, n: usize) -> &[String] {
        let start = self.lines.len().saturating_sub(n);
        &self.lines[start..]
    }
}

/// The durable record of one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub host_id: String,
    pub component: String,

    #[serde(default)]
    pub from_version: Option<String>,
    #[serde(default)]
    pub to_version: Option<String>,

    /// SHA-256 of the rendered config content (deploy-config tasks)
    #[serde(default)]
    pub config_fingerprint: Option<String>,

    #[serde(default)]
    pub strategy: Option<UpgradeStrategy>,

    pub status: TaskStatus,
    pub progress: u8,
    pub steps: Vec<Step>,

    #[serde(default)]
    pub backup_paths: HashMap<String, String>,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub log: LogBuffer,

    #[serde(default)]
    pub error: Option<String>,

    /// Aggregated per-target results for fan-out tasks
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        kind: TaskKind,
        host_id: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            host_id: host_id.into(),
            component: component.into(),
            from_version: None,
            to_version: None,
            config_fingerprint: None,
            strategy: None,
            status: TaskStatus::Pending,
            progress: 0,
            steps: Vec::new(),
            backup_paths: HashMap::new(),
            started_at: None,
            ended_at: None,
            log: LogBuffer::default(),
            error: None,
            details: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `floor(100 · completed / total)`, never decreasing
    pub fn recompute_progress(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let computed = (100 * completed / self.steps.len()) as u8;
        self.progress = self.progress.max(computed);
    }

    pub fn begin(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Move to a terminal state. A task already terminal never transitions
    /// again.
    pub fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        if self.is_terminal() {
            return;
        }
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
        if status == TaskStatus::Completed {
            self.progress = 100;
        }
    }

    pub fn append_log(&mut self, message: impl AsRef<str>) {
        let line = format!("[{}] {}", Utc::now().to_rfc3339(), message.as_ref());
        self.log.append(line);
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn mark_step_running(&mut self, name: &str) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
        }
    }

    pub fn mark_step_completed(&mut self, name: &str, stdout_tail: String) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Completed;
            step.ended_at = Some(Utc::now());
            step.stdout_tail = stdout_tail;
        }
        self.recompute_progress();
    }

    pub fn mark_step_failed(&mut self, name: &str, error: String) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Failed;
            step.ended_at = Some(Utc::now());
            step.error = Some(error);
        }
    }

    pub fn mark_step_skipped(&mut self, name: &str) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Skipped;
            step.started_at = Some(Utc::now());
            step.ended_at = step.started_at;
        }
    }
}
