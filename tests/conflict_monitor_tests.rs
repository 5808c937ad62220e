// Conflict monitor integration tests
// Alerts on the system topic, auto-resolution and shutdown

use concord::config::ConflictRules;
use concord::{
    AgentContext, ConcordConfig, ConflictStatus, CoordinationError, Coordinator, LeaseOperation,
    ResolutionStrategy, StateWrite, Topic,
};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

async fn contended(dir: &TempDir) -> Coordinator {
    let coordinator = Coordinator::open(ConcordConfig::default().with_root(dir.path())).unwrap();
    let first = AgentContext::new("c1", "coder");
    let second = AgentContext::new("t1", "tester");
    coordinator
        .claim_resource(&first, "file", "/src/lib.rs", LeaseOperation::Modify, None)
        .await
        .unwrap();
    let outcome = coordinator
        .claim_resource(&second, "file", "/src/lib.rs", LeaseOperation::Modify, None)
        .await
        .unwrap();
    assert!(!outcome.is_granted());
    coordinator
}

#[tokio::test]
async fn test_monitor_alerts_once_per_conflict() {
    let dir = TempDir::new().unwrap();
    let coordinator = contended(&dir).await;
    let ops = AgentContext::new("ops", "reviewer");
    coordinator
        .subscribe(&ops, [Topic::System].into_iter().collect(), None)
        .unwrap();

    let monitor = coordinator.monitor().with_auto_resolve(false);
    let first = monitor.poll_once().await.unwrap();
    assert_eq!(first.alerts.len(), 1);
    assert!(first.resolved.is_empty());

    let second = monitor.poll_once().await.unwrap();
    assert!(second.new_conflicts.is_empty());

    let alerts: Vec<_> = coordinator
        .read(&ops, 10, Some(Topic::System))
        .unwrap()
        .into_iter()
        .filter(|m| m.payload["event"] == "conflict_alert")
        .collect();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].payload["conflict_id"], first.alerts[0].as_str());
}

#[tokio::test]
async fn test_monitor_auto_resolves_by_priority() {
    let dir = TempDir::new().unwrap();
    let coordinator = contended(&dir).await;

    let report = coordinator
        .monitor()
        .with_auto_resolve(true)
        .poll_once()
        .await
        .unwrap();

    assert_eq!(report.resolved.len(), 1);
    assert_eq!(report.resolved[0].winner.as_deref(), Some("t1"));
    assert!(coordinator.conflicts(Some(ConflictStatus::Active)).unwrap().is_empty());
}

#[tokio::test]
async fn test_monitor_run_stops_on_shutdown_signal() {
    let dir = TempDir::new().unwrap();
    let coordinator = contended(&dir).await;
    let monitor = coordinator
        .monitor()
        .with_auto_resolve(true)
        .with_interval(Duration::from_millis(20));

    let (tx, rx) = watch::channel(false);
    let stopper = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
    };

    let (result, ()) = tokio::join!(monitor.run(rx), stopper);
    result.unwrap();
    assert_eq!(coordinator.conflicts(Some(ConflictStatus::Resolved)).unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_auto_resolution_raises_one_alert() {
    let dir = TempDir::new().unwrap();
    let mut config = ConcordConfig::default().with_root(dir.path());
    config.conflicts.rules = ConflictRules {
        state_conflict: ResolutionStrategy::Sequential,
        ..ConflictRules::default()
    };
    let coordinator = Coordinator::open(config).unwrap();
    let a = AgentContext::new("a", "coder");
    let b = AgentContext::new("b", "coder");
    let ops = AgentContext::new("ops", "reviewer");
    coordinator
        .subscribe(&ops, [Topic::System].into_iter().collect(), None)
        .unwrap();

    coordinator.set(&a, "app", "owner", json!("a")).await.unwrap();
    let seen = coordinator.clock(&b, "app", Some("owner")).unwrap();
    coordinator.set(&a, "app", "owner", json!("a2")).await.unwrap();
    let outcome = coordinator
        .set_with_clock(&b, "app", "owner", json!("b"), seen.ticked("b"))
        .await
        .unwrap();
    assert!(matches!(outcome, StateWrite::Conflict { .. }));

    let monitor = coordinator.monitor().with_auto_resolve(true);
    let first = monitor.poll_once().await.unwrap();
    assert!(first.resolved.is_empty());
    assert_eq!(first.failed.len(), 1);
    assert_eq!(first.alerts, vec![first.failed[0].conflict_id.clone()]);

    let second = monitor.poll_once().await.unwrap();
    assert!(second.alerts.is_empty());
    assert!(second.failed.is_empty());

    let alerts: Vec<_> = coordinator
        .read(&ops, 10, Some(Topic::System))
        .unwrap()
        .into_iter()
        .filter(|m| m.payload["event"] == "conflict_alert")
        .collect();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].payload["failure"].is_string());
    assert_eq!(coordinator.conflicts(Some(ConflictStatus::Active)).unwrap().len(), 1);
}

#[tokio::test]
async fn test_monitor_rejects_zero_interval() {
    let dir = TempDir::new().unwrap();
    let coordinator = contended(&dir).await;
    let (_tx, rx) = watch::channel(false);

    let err = coordinator
        .monitor()
        .with_interval(Duration::ZERO)
        .run(rx)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Config(_)));
}
