//! Task model and orchestrator unit tests

use std::sync::Arc;

use monplane::errors::ControlError;
use monplane::tasks::{
    LogBuffer, MemoryTaskStore, Step, StepStatus, Task, TaskKind, TaskManager, TaskStatus,
    UpgradeStrategy, LOG_DROP_MARKER, LOG_MAX_LINES,
};

fn task_with_steps(n: usize) -> Task {
    let mut task = Task::new("t1", TaskKind::UpgradeComponent, "h1", "node-exporter");
    task.steps = (0..n)
        .map(|i| Step::new(format!("step-{}", i), "test step"))
        .collect();
    task
}

#[test]
fn test_progress_is_floor_of_completed_ratio() {
    let mut task = task_with_steps(3);
    assert_eq!(task.progress, 0);

    task.mark_step_completed("step-0", String::new());
    assert_eq!(task.progress, 33);

    task.mark_step_completed("step-1", String::new());
    assert_eq!(task.progress, 66);

    task.mark_step_completed("step-2", String::new());
    assert_eq!(task.progress, 100);
}

#[test]
fn test_progress_never_decreases() {
    let mut task = task_with_steps(4);
    task.mark_step_completed("step-0", String::new());
    task.mark_step_completed("step-1", String::new());
    assert_eq!(task.progress, 50);

    // recomputing against the same steps cannot move progress backwards
    task.recompute_progress();
    assert_eq!(task.progress, 50);
}

#[test]
fn test_terminal_state_is_final() {
    let mut task = task_with_steps(2);
    task.begin();
    task.finish(TaskStatus::Failed, Some("boom".to_string()));

    assert!(task.is_terminal());
    assert!(task.ended_at.is_some());
    assert!(task.ended_at.unwrap() >= task.started_at.unwrap());

    // a second transition is ignored
    task.finish(TaskStatus::Completed, None);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("boom"));
}

#[test]
fn test_step_timestamps() {
    let mut task = task_with_steps(1);
    task.mark_step_running("step-0");
    let step = &task.steps[0];
    assert_eq!(step.status, StepStatus::Running);
    assert!(step.started_at.is_some());

    task.mark_step_completed("step-0", "out".to_string());
    let step = &task.steps[0];
    assert!(step.ended_at.unwrap() >= step.started_at.unwrap());
    assert_eq!(step.stdout_tail, "out");
}

#[test]
fn test_log_buffer_caps_lines_with_marker() {
    let mut log = LogBuffer::default();
    for i in 0..LOG_MAX_LINES + 50 {
        log.append(format!("line {}", i));
    }
    assert!(log.lines().len() <= LOG_MAX_LINES + 1);
    assert_eq!(log.lines().first().map(String::as_str), Some(LOG_DROP_MARKER));
    assert!(log.lines().last().unwrap().contains(&format!("line {}", LOG_MAX_LINES + 49)));
}

#[test]
fn test_log_buffer_caps_bytes() {
    let mut log = LogBuffer::default();
    let big = "x".repeat(128 * 1024);
    for _ in 0..12 {
        log.append(big.clone());
    }
    let total: usize = log.lines().iter().map(String::len).sum();
    assert!(total <= 1024 * 1024 + LOG_DROP_MARKER.len());
    assert_eq!(log.lines().first().map(String::as_str), Some(LOG_DROP_MARKER));
}

#[test]
fn test_strategy_defaults_from_empty_json() {
    let strategy: UpgradeStrategy = serde_json::from_str("{}").unwrap();
    assert!(strategy.backup_config);
    assert!(!strategy.backup_data);
    assert!(strategy.stop_before_switch);
    assert!(strategy.rollback_on_failure);
    assert_eq!(strategy.upgrade_timeout_secs, 600);
    assert_eq!(strategy.health_check_delay_secs, 5);
}

#[test]
fn test_task_snapshot_round_trip() {
    let mut task = task_with_steps(2);
    task.strategy = Some(UpgradeStrategy::default());
    task.from_version = Some("1.6.1".to_string());
    task.to_version = Some("1.7.0".to_string());
    task.begin();
    task.append_log("hello");
    task.backup_paths.insert(
        "config".to_string(),
        "/opt/monitoring/backups/node-exporter/20260301_000000".to_string(),
    );

    let json = serde_json::to_string(&task).unwrap();
    let restored: Task = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.id, task.id);
    assert_eq!(restored.status, TaskStatus::Running);
    assert_eq!(restored.steps.len(), 2);
    assert_eq!(restored.backup_paths, task.backup_paths);
    assert_eq!(restored.log.lines().len(), 1);
}

#[tokio::test]
async fn test_orphan_sweep_fails_running_tasks() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryTaskStore::new())));

    let mut running = task_with_steps(2);
    running.begin();
    manager.save(&running).await.unwrap();

    let mut done = Task::new("t2", TaskKind::DeployConfig, "h2", "prometheus");
    done.begin();
    done.finish(TaskStatus::Completed, None);
    manager.save(&done).await.unwrap();

    let swept = manager.sweep_orphans().await.unwrap();
    assert_eq!(swept, 1);

    let orphaned = manager.get("t1").await.unwrap();
    assert_eq!(orphaned.status, TaskStatus::Failed);
    assert!(orphaned
        .error
        .as_deref()
        .unwrap()
        .contains("orphaned by process restart"));
    assert_eq!(
        manager.get("t2").await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_claim_is_mutually_exclusive() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryTaskStore::new())));

    let claim = manager.claim("h1", "prometheus").unwrap();
    let second = manager.claim("h1", "prometheus");
    assert!(matches!(second, Err(ControlError::Conflict(_))));

    // a different pair is fine
    manager.claim("h2", "prometheus").unwrap();
    manager.claim("h1", "grafana").unwrap();

    // releasing the claim frees the pair
    drop(claim);
    manager.claim("h1", "prometheus").unwrap();
}

#[tokio::test]
async fn test_cancel_pending_task_is_terminal() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryTaskStore::new())));
    let task = task_with_steps(2);
    manager.create(&task).await.unwrap();

    let status = manager.cancel("t1").await.unwrap();
    assert_eq!(status, TaskStatus::Canceled);
    let task = manager.get("t1").await.unwrap();
    assert!(task.is_terminal());
    assert!(task.ended_at.is_some());
}

#[tokio::test]
async fn test_list_by_status_filters() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryTaskStore::new())));
    let mut a = task_with_steps(1);
    a.id = "a".to_string();
    a.begin();
    manager.save(&a).await.unwrap();

    let mut b = task_with_steps(1);
    b.id = "b".to_string();
    manager.save(&b).await.unwrap();

    let running = manager
        .list_by_status(Some(TaskStatus::Running))
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, "a");

    let all = manager.list_by_status(None).await.unwrap();
    assert_eq!(all.len(), 2);
}
