//! Fan-out executor
//!
//! Runs one operation against many targets with bounded concurrency. A
//! target failure never cancels its peers; cancellation of the parent task
//! is cooperative. Worker panics are caught and recorded as that target's
//! failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::tasks::CancelFlag;

pub const DEFAULT_MAX_CONCURRENT_TARGETS: usize = 10;

#[derive(Debug, Clone)]
pub struct FanoutOptions {
    /// Targets in flight at once
    pub max_concurrent_targets: usize,
}

impl Default for FanoutOptions {
    fn default() -> Self {
        Self {
            max_concurrent_targets: DEFAULT_MAX_CONCURRENT_TARGETS,
        }
    }
}

/// Per-target sub-result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetResult {
    pub target_id: String,
    pub success: bool,
    /// Some but not all of the workflow took effect (e.g. uploaded but
    /// failed verification)
    pub partial: bool,
    pub message: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl TargetResult {
    pub fn canceled(target_id: String) -> Self {
        Self {
            target_id,
            success: false,
            partial: false,
            message: "canceled before execution".to_string(),
            duration_ms: 0,
            details: serde_json::Value::Null,
        }
    }
}

/// Aggregate over all targets; the categories partition `total`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FanoutSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub partial: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutReport {
    pub summary: FanoutSummary,
    pub results: Vec<TargetResult>,
}

pub struct FanoutExecutor {
    options: FanoutOptions,
}

impl FanoutExecutor {
    pub fn new(options: FanoutOptions) -> Self {
        Self { options }
    }

    /// Run `op` against every target, at most `max_concurrent_targets` in
    /// flight. Results come back in completion order.
    pub async fn run<T, F, Fut>(
        &self,
        targets: Vec<T>,
        cancel: CancelFlag,
        id_of: impl Fn(&T) -> String,
        op: F,
    ) -> FanoutReport
    where
        T: Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = TargetResult> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_targets.max(1)));
        let mut set: JoinSet<TargetResult> = JoinSet::new();
        let mut spawned_ids: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut results = Vec::with_capacity(targets.len());

        for target in targets {
            let target_id = id_of(&target);
            if cancel.is_canceled() {
                results.push(TargetResult::canceled(target_id));
                continue;
            }

            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let fut = op(target);
            let id_for_worker = target_id.clone();
            let handle = set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                if cancel.is_canceled() {
                    return TargetResult::canceled(id_for_worker);
                }
                fut.await
            });
            spawned_ids.insert(handle.id(), target_id);
        }

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, result)) => results.push(result),
                Err(join_err) => {
                    let target_id = spawned_ids
                        .get(&join_err.id())
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    warn!("worker for target {} died: {}", target_id, join_err);
                    results.push(TargetResult {
                        target_id,
                        success: false,
                        partial: false,
                        message: format!("worker panicked: {}", join_err),
                        duration_ms: 0,
                        details: serde_json::Value::Null,
                    });
                }
            }
        }

        let mut summary = FanoutSummary {
            total: results.len(),
            ..Default::default()
        };
        for result in &results {
            if result.success {
                summary.successful += 1;
            } else if result.partial {
                summary.partial += 1;
            } else {
                summary.failed += 1;
            }
        }

        FanoutReport { summary, results }
    }
}
