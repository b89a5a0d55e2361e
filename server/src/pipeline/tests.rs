use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use super::*;
use crate::errors::ControlError;
use crate::fanout::FanoutReport;
use crate::inventory::{Credential, Host};
use crate::render::Artifact;
use crate::tasks::{MemoryTaskStore, Task, TaskHandle, TaskKind, TaskManager};
use crate::testutil::ScriptedShell;

fn host(id: &str) -> Host {
    Host {
        id: id.to_string(),
        addr: format!("10.0.0.{}", id.len()),
        port: 22,
        username: "ops".to_string(),
        credential: Credential::Password {
            password: "secret".to_string(),
        },
        pinned_host_key: None,
    }
}

/// Session source handing out scripted shells, optionally refusing auth
struct FakeSource {
    shells: HashMap<String, Arc<ScriptedShell>>,
    auth_fail: HashSet<String>,
}

#[async_trait]
impl SessionSource for FakeSource {
    async fn connect(&self, host: &Host) -> Result<Box<dyn CommandChannel>, ControlError> {
        if self.auth_fail.contains(&host.id) {
            return Err(ControlError::AuthFailed(format!(
                "authentication rejected for {}@{}",
                host.username, host.addr
            )));
        }
        Ok(Box::new(
            self.shells.get(&host.id).expect("scripted shell").clone(),
        ))
    }
}

fn prometheus_request(validate: bool, backup: bool, auto_restart: bool) -> ConfigDeployRequest {
    ConfigDeployRequest {
        component: "prometheus".to_string(),
        artifact: Artifact {
            target_path: "/etc/prometheus/prometheus.yml".to_string(),
            content: "global:\n  scrape_interval: 15s\n".to_string(),
            mode: 0o644,
            owner_user: None,
            owner_group: None,
        },
        validate,
        backup,
        auto_restart,
        reload_endpoint: None,
    }
}

async fn start_deploy_task(
    manager: &Arc<TaskManager>,
    id: &str,
    req: &ConfigDeployRequest,
    targets: &[TargetSpec],
) -> TaskHandle {
    let host_ids: Vec<String> = targets.iter().map(|t| t.host.id.clone()).collect();
    let mut task = Task::new(
        id,
        TaskKind::DeployConfig,
        host_ids.join(","),
        req.component.clone(),
    );
    task.steps = if targets.len() == 1 {
        build_steps(req)
    } else {
        build_target_steps(targets)
    };
    manager.create(&task).await.unwrap();
    manager.start(&task.id).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_validator_rejection_leaves_destination_untouched() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryTaskStore::new())));
    let shell = Arc::new(
        ScriptedShell::new()
            .ok("test -f", "")
            .fail(
                "promtool check config",
                1,
                "error: missing scrape_configs section",
            ),
    );
    let source = Arc::new(FakeSource {
        shells: HashMap::from([("h1".to_string(), shell.clone())]),
        auth_fail: HashSet::new(),
    });

    let req = prometheus_request(true, true, false);
    let targets = vec![TargetSpec {
        host: host("h1"),
        service_name: None,
        config_path: None,
    }];
    let handle = start_deploy_task(&manager, "config_test_reject", &req, &targets).await;

    let task = execute(handle, source, Default::default(), req, targets)
        .await
        .unwrap();

    assert_eq!(task.status, crate::tasks::TaskStatus::Failed);
    assert!(task
        .error
        .as_deref()
        .unwrap()
        .contains("config validation failed"));

    let validate = task.steps.iter().find(|s| s.name == STEP_VALIDATE).unwrap();
    assert_eq!(validate.status, crate::tasks::StepStatus::Failed);
    let upload = task.steps.iter().find(|s| s.name == STEP_UPLOAD).unwrap();
    assert_eq!(upload.status, crate::tasks::StepStatus::Completed);

    // staged, validated on the staging file, never renamed into place
    assert!(shell.ran("sudo tee '/etc/prometheus/prometheus.yml.staging.config_test_reject'"));
    assert!(shell.ran("promtool check config '/etc/prometheus/prometheus.yml.staging.config_test_reject'"));
    assert!(!shell.ran("sudo mv -f"));
    assert!(shell.ran("sudo rm -f '/etc/prometheus/prometheus.yml.staging.config_test_reject'"));

    let report: FanoutReport = serde_json::from_value(task.details.unwrap()).unwrap();
    assert_eq!(report.summary.failed, 1);
    assert!(!report.results[0].partial);
}

fn healthy_shell() -> Arc<ScriptedShell> {
    Arc::new(
        ScriptedShell::new()
            .ok("test -f", "")
            .ok("promtool check config", "SUCCESS")
            .ok("docker ps", "")
            .ok("systemctl is-active", "active\n")
            .ok("MainPID", "MainPID=4242")
            .ok("--version", "prometheus, version 3.0.1")
            .ok("sha256sum", "3f6a1d2c0b9e8f7a6b5c4d3e2f1a0908\n"),
    )
}

#[tokio::test(start_paused = true)]
async fn test_deploy_happy_path_single_target() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryTaskStore::new())));
    let shell = healthy_shell();
    let source = Arc::new(FakeSource {
        shells: HashMap::from([("h1".to_string(), shell.clone())]),
        auth_fail: HashSet::new(),
    });

    let req = prometheus_request(true, true, true);
    let targets = vec![TargetSpec {
        host: host("h1"),
        service_name: None,
        config_path: None,
    }];
    let handle = start_deploy_task(&manager, "config_test_happy", &req, &targets).await;

    let task = execute(handle, source, Default::default(), req, targets)
        .await
        .unwrap();

    assert_eq!(task.status, crate::tasks::TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    for step in &task.steps {
        assert_eq!(step.status, crate::tasks::StepStatus::Completed, "{}", step.name);
    }

    // the new bytes went through staging into place and the service came back
    assert!(shell.stdin_for("sudo tee").unwrap().contains("scrape_interval"));
    assert!(shell.ran("sudo mv -f"));
    assert!(shell.ran("sudo systemctl restart 'prometheus'"));

    let report: FanoutReport = serde_json::from_value(task.details.unwrap()).unwrap();
    assert_eq!(report.summary.successful, 1);
    let service = &report.results[0].details["service"];
    assert_eq!(service["status"], "active");
    assert_eq!(service["pid"], "4242");
}

#[tokio::test(start_paused = true)]
async fn test_identical_redeploy_verifies_to_same_hash() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryTaskStore::new())));

    let mut hashes = Vec::new();
    for task_id in ["config_test_idem_1", "config_test_idem_2"] {
        let source = Arc::new(FakeSource {
            shells: HashMap::from([("h1".to_string(), healthy_shell())]),
            auth_fail: HashSet::new(),
        });
        let req = prometheus_request(true, true, true);
        let targets = vec![TargetSpec {
            host: host("h1"),
            service_name: None,
            config_path: None,
        }];
        let handle = start_deploy_task(&manager, task_id, &req, &targets).await;
        let task = execute(handle, source, Default::default(), req, targets)
            .await
            .unwrap();
        assert_eq!(task.status, crate::tasks::TaskStatus::Completed);
        let report: FanoutReport = serde_json::from_value(task.details.unwrap()).unwrap();
        hashes.push(report.results[0].details["service"]["config_sha256"].clone());
    }
    assert_eq!(hashes[0], hashes[1]);
}

#[tokio::test(start_paused = true)]
async fn test_fanout_partial_success_aggregates() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryTaskStore::new())));
    let source = Arc::new(FakeSource {
        shells: HashMap::from([
            ("h1".to_string(), healthy_shell()),
            ("h3".to_string(), healthy_shell()),
        ]),
        auth_fail: HashSet::from(["h2".to_string()]),
    });

    let req = prometheus_request(false, false, false);
    let targets: Vec<TargetSpec> = ["h1", "h2", "h3"]
        .into_iter()
        .map(|id| TargetSpec {
            host: host(id),
            service_name: None,
            config_path: None,
        })
        .collect();
    let handle = start_deploy_task(&manager, "config_test_fanout", &req, &targets).await;

    let task = execute(handle, source, Default::default(), req, targets)
        .await
        .unwrap();

    assert_eq!(task.status, crate::tasks::TaskStatus::Failed);
    let report: FanoutReport = serde_json::from_value(task.details.clone().unwrap()).unwrap();
    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.successful, 2);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.partial, 0);

    let failed = report.results.iter().find(|r| r.target_id == "h2").unwrap();
    assert!(failed.message.contains("authentication rejected"));

    let step = task.steps.iter().find(|s| s.name == "target:h2").unwrap();
    assert_eq!(step.status, crate::tasks::StepStatus::Failed);
    let step = task.steps.iter().find(|s| s.name == "target:h1").unwrap();
    assert_eq!(step.status, crate::tasks::StepStatus::Completed);
}
