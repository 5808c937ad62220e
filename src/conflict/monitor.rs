use super::detector::CleanupReport;
use super::resolver::{ConflictResolver, ResolveFailure};
use super::{Conflict, ConflictStatus, Resolution};
use crate::bus::{Publisher, Topic};
use crate::error::{CoordinationError, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// What one monitor pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorReport {
    pub new_conflicts: Vec<String>,
    pub resolved: Vec<Resolution>,
    pub alerts: Vec<String>,
    pub failed: Vec<ResolveFailure>,
    pub cleanup: CleanupReport,
}

/// Polls for new conflicts and either resolves them automatically or raises
/// an alert, once per conflict.
#[derive(Debug)]
pub struct ConflictMonitor {
    resolver: Arc<ConflictResolver>,
    auto_resolve: bool,
    interval: Duration,
    seen: Mutex<HashSet<String>>,
}

impl ConflictMonitor {
    pub fn new(resolver: Arc<ConflictResolver>) -> Self {
        let config = resolver.config();
        let auto_resolve = config.auto_resolve;
        let interval = Duration::from_secs(config.monitor_interval_seconds);
        Self {
            resolver,
            auto_resolve,
            interval,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve = auto_resolve;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn poll_once(&self) -> Result<MonitorReport> {
        let mut report = MonitorReport {
            cleanup: self.resolver.detector().cleanup()?,
            ..Default::default()
        };

        let active = self
            .resolver
            .detector()
            .log()
            .list(Some(ConflictStatus::Active))?;
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            seen.retain(|id| active.iter().any(|c| &c.conflict_id == id));
        }

        for conflict in active {
            let first_sighting = {
                let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
                seen.insert(conflict.conflict_id.clone())
            };
            if !first_sighting {
                continue;
            }
            report.new_conflicts.push(conflict.conflict_id.clone());

            if !self.auto_resolve {
                self.alert(&conflict, None);
                report.alerts.push(conflict.conflict_id.clone());
                continue;
            }

            let strategy = self.resolver.auto_strategy(&conflict);
            match self.resolver.resolve(&conflict.conflict_id, strategy, "monitor").await {
                Ok(resolution) => report.resolved.push(resolution),
                Err(e) if e.is_recoverable() => {
                    let reason = e.to_string();
                    self.alert(&conflict, Some(&reason));
                    report.alerts.push(conflict.conflict_id.clone());
                    report.failed.push(ResolveFailure {
                        conflict_id: conflict.conflict_id.clone(),
                        reason,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Warn and publish a `conflict_alert` on the system topic.
    fn alert(&self, conflict: &Conflict, failure: Option<&str>) {
        warn!(
            conflict_id = %conflict.conflict_id,
            conflict_type = %conflict.conflict_type,
            severity = %conflict.severity,
            failure = ?failure,
            "unresolved conflict needs attention"
        );
        self.resolver.detector().publish(
            Topic::System,
            json!({
                "event": "conflict_alert",
                "conflict_id": conflict.conflict_id,
                "conflict_type": conflict.conflict_type,
                "severity": conflict.severity,
                "subject": conflict.subject,
                "suggested_strategy": self.resolver.auto_strategy(conflict),
                "failure": failure,
            }),
            Publisher::new("monitor", "concord"),
        );
    }

    /// Poll every interval until `shutdown` becomes true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.interval.is_zero() {
            return Err(CoordinationError::Config(
                "monitor interval must be positive".to_string(),
            ));
        }
        info!(interval_ms = self.interval.as_millis() as u64, auto_resolve = self.auto_resolve, "conflict monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(report) if !report.new_conflicts.is_empty() => {
                            info!(
                                new = report.new_conflicts.len(),
                                resolved = report.resolved.len(),
                                alerts = report.alerts.len(),
                                "monitor pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "monitor pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("conflict monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictConfig, LockConfig, PriorityTable};
    use crate::conflict::{ConflictDetector, ResolutionStrategy};
    use crate::coordinator::AgentContext;
    use crate::lease::{LeaseManager, LeaseOperation};
    use crate::state::NamespaceStore;
    use crate::storage::Storage;
    use tempfile::TempDir;

    fn monitor(dir: &TempDir, auto_resolve: bool) -> (Arc<ConflictDetector>, ConflictMonitor) {
        let storage = Storage::new(dir.path());
        let leases = Arc::new(LeaseManager::new(storage.clone(), LockConfig::default()));
        let detector = Arc::new(ConflictDetector::new(storage.clone(), leases.clone(), LockConfig::default()));
        let store = Arc::new(NamespaceStore::new(storage.clone(), leases, LockConfig::default()));
        let resolver = Arc::new(ConflictResolver::new(
            storage,
            detector.clone(),
            store,
            PriorityTable::default(),
            ConflictConfig::default(),
        ));
        (detector, ConflictMonitor::new(resolver).with_auto_resolve(auto_resolve))
    }

    fn contend(detector: &ConflictDetector) {
        let a = AgentContext::new("a", "coder");
        let b = AgentContext::new("b", "orchestrator");
        detector.claim_resource("file", "/x", &a, LeaseOperation::Modify, None).unwrap();
        detector.claim_resource("file", "/x", &b, LeaseOperation::Modify, None).unwrap();
    }

    #[tokio::test]
    async fn test_alerts_once_per_conflict() {
        let dir = TempDir::new().unwrap();
        let (detector, monitor) = monitor(&dir, false);
        contend(&detector);

        let first = monitor.poll_once().await.unwrap();
        assert_eq!(first.alerts.len(), 1);
        let second = monitor.poll_once().await.unwrap();
        assert!(second.alerts.is_empty());
    }

    #[tokio::test]
    async fn test_auto_resolves_new_conflicts() {
        let dir = TempDir::new().unwrap();
        let (detector, monitor) = monitor(&dir, true);
        contend(&detector);

        let report = monitor.poll_once().await.unwrap();
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.resolved[0].winner.as_deref(), Some("b"));
        assert!(detector.log().list(Some(ConflictStatus::Active)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (_detector, monitor) = monitor(&dir, false);
        let monitor = monitor.with_interval(Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };
        let (result, _) = tokio::join!(monitor.run(rx), stopper);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_zero_interval_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let (_detector, monitor) = monitor(&dir, false);
        let (_tx, rx) = watch::channel(false);

        let err = monitor.with_interval(Duration::ZERO).run(rx).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
    }

    #[tokio::test]
    async fn test_resolved_conflicts_leave_the_seen_set() {
        let dir = TempDir::new().unwrap();
        let (detector, monitor) = monitor(&dir, false);
        contend(&detector);

        monitor.poll_once().await.unwrap();
        let active = detector.log().list(Some(ConflictStatus::Active)).unwrap();
        monitor
            .resolver
            .resolve(&active[0].conflict_id, ResolutionStrategy::PriorityBased, "lead")
            .await
            .unwrap();

        monitor.poll_once().await.unwrap();
        assert!(monitor.seen.lock().unwrap().is_empty());
    }
}
