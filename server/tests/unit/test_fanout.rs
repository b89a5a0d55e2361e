//! Fan-out executor unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use monplane::fanout::{FanoutExecutor, FanoutOptions, TargetResult};
use monplane::tasks::CancelFlag;

fn result(target_id: &str, success: bool, partial: bool) -> TargetResult {
    TargetResult {
        target_id: target_id.to_string(),
        success,
        partial,
        message: String::new(),
        duration_ms: 1,
        details: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn test_concurrency_stays_within_bound() {
    let limit = 4;
    let executor = FanoutExecutor::new(FanoutOptions {
        max_concurrent_targets: limit,
    });
    let in_flight = Arc::new(AtomicUsize::new(0));

    let targets: Vec<usize> = (0..limit * 8).collect();
    let report = executor
        .run(targets, CancelFlag::default(), |t| t.to_string(), |t| {
            let in_flight = in_flight.clone();
            async move {
                let seen = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                let mut r = result(&t.to_string(), true, false);
                r.duration_ms = seen as u64;
                r
            }
        })
        .await;

    assert_eq!(report.summary.total, limit * 8);
    assert_eq!(report.summary.successful, limit * 8);
    for r in &report.results {
        // duration_ms smuggles out the observed in-flight watermark
        assert!(
            r.duration_ms as usize <= limit,
            "target {} saw {} concurrent workers",
            r.target_id,
            r.duration_ms
        );
    }
}

#[tokio::test]
async fn test_aggregation_partitions_outcomes() {
    let executor = FanoutExecutor::new(FanoutOptions::default());
    let targets = vec!["ok1", "ok2", "bad", "half"];

    let report = executor
        .run(targets, CancelFlag::default(), |t| t.to_string(), |t| async move {
            match t {
                "bad" => result(t, false, false),
                "half" => result(t, false, true),
                other => result(other, true, false),
            }
        })
        .await;

    assert_eq!(report.summary.total, 4);
    assert_eq!(report.summary.successful, 2);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.partial, 1);
}

#[tokio::test]
async fn test_one_failure_never_cancels_peers() {
    let executor = FanoutExecutor::new(FanoutOptions {
        max_concurrent_targets: 1,
    });
    let targets = vec!["first-fails", "second", "third"];

    let report = executor
        .run(targets, CancelFlag::default(), |t| t.to_string(), |t| async move {
            result(t, t != "first-fails", false)
        })
        .await;

    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.successful, 2);
    assert_eq!(report.summary.failed, 1);
}

#[tokio::test]
async fn test_cancellation_skips_queued_targets() {
    let executor = FanoutExecutor::new(FanoutOptions::default());
    let cancel = CancelFlag::default();
    cancel.cancel();

    let report = executor
        .run(
            vec!["a", "b", "c"],
            cancel,
            |t| t.to_string(),
            |t| async move { result(t, true, false) },
        )
        .await;

    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.successful, 0);
    assert_eq!(report.summary.failed, 3);
    for r in &report.results {
        assert!(r.message.contains("canceled"));
    }
}

#[tokio::test]
async fn test_worker_panic_is_recorded_as_failure() {
    let executor = FanoutExecutor::new(FanoutOptions::default());

    let report = executor
        .run(
            vec!["stable", "crashy"],
            CancelFlag::default(),
            |t| t.to_string(),
            |t| async move {
                if t == "crashy" {
                    panic!("worker exploded");
                }
                result(t, true, false)
            },
        )
        .await;

    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.successful, 1);
    assert_eq!(report.summary.failed, 1);
    let crashed = report
        .results
        .iter()
        .find(|r| r.target_id == "crashy")
        .unwrap();
    assert!(crashed.message.contains("panicked"));
}
