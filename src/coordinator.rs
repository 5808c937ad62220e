//! Single entry point that owns every coordination service.
//!
//! Each call is gated by the permission enforcer, then routed to the store,
//! lease manager, detector, resolver or bus. Nothing here is global; two
//! coordinators opened on the same root cooperate through the shared files.

use crate::bus::{
    Message, MessageBus, MessageMetadata, PruneReport, Publisher, Subscription, SubscriptionFilter,
    Topic,
};
use crate::clock::VectorClock;
use crate::config::ConcordConfig;
use crate::conflict::{
    ClaimOutcome, Claims, CleanupReport, Conflict, ConflictDetector, ConflictMonitor,
    ConflictResolver, ConflictStatus, ConflictType, Release, Resolution, ResolutionStrategy,
    ResolveAllReport, Rule, TaskClaim,
};
use crate::error::{CoordinationError, Result};
use crate::lease::{Lease, LeaseManager, LeaseOperation};
use crate::permission::{tools, PermissionDecision, PermissionEnforcer};
use crate::state::{
    ClockedWrite, JournalEntry, NamespaceInfo, NamespaceStore, Snapshot, SnapshotInfo, Transform,
};
use crate::storage::Storage;
use crate::telemetry::{create_coordination_span, generate_correlation_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Instrument};

/// Identity a caller presents with every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            session_id: None,
            task_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(&self.agent_type, &self.agent_id)
    }

    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            session_id: self.session_id.clone(),
            task_id: self.task_id.clone(),
            parent_task: None,
        }
    }
}

/// Result of a clocked write once concurrent proposals have been routed
/// through conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StateWrite {
    Applied {
        old_value: Option<Value>,
        clock: VectorClock,
    },
    Stale {
        stored: VectorClock,
    },
    /// The write was concurrent and the conflict was resolved inline.
    Resolved {
        resolution: Resolution,
    },
    /// The write was concurrent and the conflict awaits manual resolution.
    Conflict {
        conflict: Conflict,
    },
}

#[derive(Debug)]
pub struct Coordinator {
    config: ConcordConfig,
    storage: Storage,
    leases: Arc<LeaseManager>,
    bus: Arc<MessageBus>,
    store: Arc<NamespaceStore>,
    detector: Arc<ConflictDetector>,
    resolver: Arc<ConflictResolver>,
    permissions: PermissionEnforcer,
}

impl Coordinator {
    /// Wire every service onto the configured root directory.
    pub fn open(config: ConcordConfig) -> Result<Self> {
        config.validate()?;
        let storage = Storage::new(config.storage.root.clone());
        storage.ensure_dir(storage.root())?;

        let leases = Arc::new(LeaseManager::new(storage.clone(), config.locks.clone()));
        let bus = Arc::new(MessageBus::new(storage.clone(), config.bus.clone()));
        let store = Arc::new(
            NamespaceStore::new(storage.clone(), leases.clone(), config.locks.clone())
                .with_bus(bus.clone()),
        );
        let detector = Arc::new(
            ConflictDetector::new(storage.clone(), leases.clone(), config.locks.clone())
                .with_bus(bus.clone()),
        );
        let resolver = Arc::new(ConflictResolver::new(
            storage.clone(),
            detector.clone(),
            store.clone(),
            config.priorities.clone(),
            config.conflicts.clone(),
        ));
        let permissions = PermissionEnforcer::new(storage.clone(), config.permissions.clone());

        info!(root = %storage.root().display(), "coordinator opened");
        Ok(Self {
            config,
            storage,
            leases,
            bus,
            store,
            detector,
            resolver,
            permissions,
        })
    }

    pub fn config(&self) -> &ConcordConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<NamespaceStore> {
        &self.store
    }

    pub fn detector(&self) -> &Arc<ConflictDetector> {
        &self.detector
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn permissions(&self) -> &PermissionEnforcer {
        &self.permissions
    }

    /// Monitor configured from `conflicts.auto_resolve` and the poll interval.
    pub fn monitor(&self) -> ConflictMonitor {
        ConflictMonitor::new(self.resolver.clone())
    }

    /// Fail with `PermissionDenied` unless `agent` may use `tool`.
    pub fn authorize(&self, agent: &AgentContext, tool: &str, operation: Option<&str>) -> Result<()> {
        self.permissions
            .check(&agent.agent_id, &agent.agent_type, tool, operation)?
            .into_result(&agent.agent_type, tool)
    }

    pub fn check(&self, agent: &AgentContext, tool: &str, operation: Option<&str>) -> Result<PermissionDecision> {
        self.permissions
            .check(&agent.agent_id, &agent.agent_type, tool, operation)
    }

    // State

    pub fn get(&self, agent: &AgentContext, ns: &str, key: Option<&str>) -> Result<Option<Value>> {
        self.authorize(agent, tools::STATE_READ, None)?;
        self.store.get(ns, key)
    }

    pub async fn set(&self, agent: &AgentContext, ns: &str, key: &str, value: Value) -> Result<Option<Value>> {
        self.authorize(agent, tools::STATE_WRITE, Some(&format!("set {ns}/{key}")))?;
        let span = create_coordination_span("state_set", Some(&agent.agent_id), Some(&generate_correlation_id()));
        self.store.set(ns, key, value, agent).instrument(span).await
    }

    /// Write with the caller's vector clock. Concurrent proposals become a
    /// `state_conflict` that is resolved with the configured state strategy.
    pub async fn set_with_clock(
        &self,
        agent: &AgentContext,
        ns: &str,
        key: &str,
        value: Value,
        clock: VectorClock,
    ) -> Result<StateWrite> {
        self.authorize(agent, tools::STATE_WRITE, Some(&format!("set {ns}/{key}")))?;
        let span = create_coordination_span("state_set_clocked", Some(&agent.agent_id), Some(&generate_correlation_id()));

        async {
            match self.store.set_with_clock(ns, key, value, agent, clock).await? {
                ClockedWrite::Applied { old_value, clock } => Ok(StateWrite::Applied { old_value, clock }),
                ClockedWrite::Stale { stored } => Ok(StateWrite::Stale { stored }),
                ClockedWrite::Concurrent {
                    current,
                    stored,
                    proposed_value,
                    proposed,
                    last_writer,
                } => {
                    let conflict = self.detector.record_state_conflict(
                        ns,
                        key,
                        agent,
                        current,
                        stored,
                        last_writer,
                        proposed_value,
                        proposed,
                    )?;
                    let strategy = self.resolver.auto_strategy(&conflict);
                    match self
                        .resolver
                        .resolve(&conflict.conflict_id, strategy, &agent.agent_id)
                        .await
                    {
                        Ok(resolution) => Ok(StateWrite::Resolved { resolution }),
                        Err(CoordinationError::ManualResolutionRequired { .. }) => {
                            let conflict = self.detector.log().get(&conflict.conflict_id)?;
                            Ok(StateWrite::Conflict { conflict })
                        }
                        Err(e) => Err(e),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn update(&self, agent: &AgentContext, ns: &str, key: &str, transform: &Transform) -> Result<Value> {
        self.authorize(agent, tools::STATE_WRITE, Some(&format!("update {ns}/{key}")))?;
        let span = create_coordination_span("state_update", Some(&agent.agent_id), Some(&generate_correlation_id()));
        self.store.update_with(ns, key, transform, agent).instrument(span).await
    }

    pub async fn delete(&self, agent: &AgentContext, ns: &str, key: &str) -> Result<Option<Value>> {
        self.authorize(agent, tools::STATE_WRITE, Some(&format!("delete {ns}/{key}")))?;
        let span = create_coordination_span("state_delete", Some(&agent.agent_id), Some(&generate_correlation_id()));
        self.store.delete(ns, key, agent).instrument(span).await
    }

    pub async fn snapshot(&self, agent: &AgentContext, ns: &str, description: &str) -> Result<Snapshot> {
        self.authorize(agent, tools::STATE_WRITE, Some(&format!("snapshot {ns}")))?;
        self.store.snapshot(ns, description, agent).await
    }

    pub async fn restore(&self, agent: &AgentContext, ns: &str, snapshot_id: &str) -> Result<Snapshot> {
        self.authorize(agent, tools::STATE_WRITE, Some(&format!("restore {ns}")))?;
        let span = create_coordination_span("state_restore", Some(&agent.agent_id), Some(&generate_correlation_id()));
        self.store.restore(ns, snapshot_id, agent).instrument(span).await
    }

    pub fn snapshots(&self, agent: &AgentContext, ns: &str) -> Result<Vec<SnapshotInfo>> {
        self.authorize(agent, tools::STATE_READ, None)?;
        self.store.snapshots(ns)
    }

    pub fn inspect(&self, agent: &AgentContext, ns: &str) -> Result<NamespaceInfo> {
        self.authorize(agent, tools::STATE_READ, None)?;
        self.store.inspect(ns)
    }

    pub fn namespaces(&self, agent: &AgentContext) -> Result<Vec<String>> {
        self.authorize(agent, tools::STATE_READ, None)?;
        self.store.namespaces()
    }

    pub fn journal(&self, agent: &AgentContext, ns: &str, key: Option<&str>) -> Result<Vec<JournalEntry>> {
        self.authorize(agent, tools::STATE_READ, None)?;
        self.store.journal(ns, key)
    }

    pub fn clock(&self, agent: &AgentContext, ns: &str, key: Option<&str>) -> Result<VectorClock> {
        self.authorize(agent, tools::STATE_READ, None)?;
        self.store.clock(ns, key)
    }

    // Resources and tasks

    /// Claim a resource. With `auto_resolve` on, a contention is resolved
    /// immediately and the requester gets the lease if it won.
    pub async fn claim_resource(
        &self,
        agent: &AgentContext,
        resource_type: &str,
        resource_path: &str,
        operation: LeaseOperation,
        ttl_seconds: Option<u64>,
    ) -> Result<ClaimOutcome<Lease>> {
        self.authorize(
            agent,
            tools::RESOURCE_CLAIM,
            Some(&format!("{operation} {resource_type}:{resource_path}")),
        )?;
        let outcome = self
            .detector
            .claim_resource(resource_type, resource_path, agent, operation, ttl_seconds)?;

        let conflict = match outcome {
            ClaimOutcome::Conflict(conflict) => conflict,
            granted => return Ok(granted),
        };
        if !self.config.conflicts.auto_resolve {
            return Ok(ClaimOutcome::Conflict(conflict));
        }
        match self.auto_resolve(&conflict, agent).await? {
            Some(resolution) if resolution.winner.as_deref() == Some(agent.agent_id.as_str()) => {
                let key = crate::lease::resource_key(resource_type, resource_path);
                match self
                    .leases
                    .inspect(&key)?
                    .and_then(|record| record.holder(&agent.agent_id).cloned())
                {
                    Some(lease) => Ok(ClaimOutcome::Granted(lease)),
                    None => Ok(ClaimOutcome::Conflict(self.detector.log().get(&conflict.conflict_id)?)),
                }
            }
            _ => Ok(ClaimOutcome::Conflict(self.detector.log().get(&conflict.conflict_id)?)),
        }
    }

    pub fn release_resource(
        &self,
        agent: &AgentContext,
        resource_type: &str,
        resource_path: &str,
    ) -> Result<Release<Lease>> {
        self.authorize(agent, tools::RESOURCE_CLAIM, None)?;
        self.detector
            .release_resource(resource_type, resource_path, &agent.agent_id)
    }

    pub fn renew(&self, agent: &AgentContext, resource_type: &str, resource_path: &str, lease_id: u64) -> Result<Lease> {
        self.authorize(agent, tools::RESOURCE_CLAIM, None)?;
        self.leases
            .renew(&crate::lease::resource_key(resource_type, resource_path), lease_id)
    }

    pub async fn claim_task(
        &self,
        agent: &AgentContext,
        task_id: &str,
        task_type: &str,
    ) -> Result<ClaimOutcome<TaskClaim>> {
        self.authorize(agent, tools::TASK_CLAIM, Some(&format!("claim task {task_id} ({task_type})")))?;
        let outcome = self.detector.claim_task(task_id, task_type, agent)?;

        let conflict = match outcome {
            ClaimOutcome::Conflict(conflict) => conflict,
            granted => return Ok(granted),
        };
        if !self.config.conflicts.auto_resolve {
            return Ok(ClaimOutcome::Conflict(conflict));
        }
        self.auto_resolve(&conflict, agent).await?;
        match self.detector.task(task_id)? {
            Some(task) if task.agent_id == agent.agent_id => Ok(ClaimOutcome::Granted(task)),
            _ => Ok(ClaimOutcome::Conflict(self.detector.log().get(&conflict.conflict_id)?)),
        }
    }

    pub fn release_task(&self, agent: &AgentContext, task_id: &str) -> Result<Release<TaskClaim>> {
        self.authorize(agent, tools::TASK_CLAIM, None)?;
        self.detector.release_task(task_id, &agent.agent_id)
    }

    pub fn list_claims(&self) -> Result<Claims> {
        self.detector.list_claims()
    }

    pub fn cleanup(&self) -> Result<CleanupReport> {
        self.detector.cleanup()
    }

    /// Resolve with the automatic strategy; a conflict that needs a human
    /// stays active and yields `None`.
    async fn auto_resolve(&self, conflict: &Conflict, agent: &AgentContext) -> Result<Option<Resolution>> {
        let strategy = self.resolver.auto_strategy(conflict);
        match self
            .resolver
            .resolve(&conflict.conflict_id, strategy, &agent.agent_id)
            .await
        {
            Ok(resolution) => Ok(Some(resolution)),
            Err(CoordinationError::ManualResolutionRequired { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // Conflicts

    pub async fn resolve(
        &self,
        agent: &AgentContext,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution> {
        self.authorize(agent, tools::CONFLICT_RESOLVE, Some(&format!("resolve {conflict_id}")))?;
        let span = create_coordination_span("conflict_resolve", Some(&agent.agent_id), Some(&generate_correlation_id()));
        self.resolver
            .resolve(conflict_id, strategy, &agent.agent_id)
            .instrument(span)
            .await
    }

    pub async fn resolve_all(
        &self,
        agent: &AgentContext,
        strategy: Option<ResolutionStrategy>,
        conflict_type: Option<ConflictType>,
    ) -> Result<ResolveAllReport> {
        self.authorize(agent, tools::CONFLICT_RESOLVE, Some("resolve all conflicts"))?;
        let span = create_coordination_span("conflict_resolve_all", Some(&agent.agent_id), Some(&generate_correlation_id()));
        self.resolver
            .resolve_all(strategy, conflict_type, &agent.agent_id)
            .instrument(span)
            .await
    }

    pub fn conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<Conflict>> {
        self.detector.log().list(status)
    }

    pub fn conflict(&self, conflict_id: &str) -> Result<Conflict> {
        self.detector.log().get(conflict_id)
    }

    pub fn resolutions(&self) -> Result<Vec<Resolution>> {
        self.resolver.history()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.resolver.rules()
    }

    pub fn priority(&self, agent_type: &str) -> u32 {
        self.resolver.priority(agent_type)
    }

    // Messaging

    pub fn publish(&self, agent: &AgentContext, topic: Topic, payload: Value) -> Result<String> {
        self.authorize(agent, tools::PUBLISH, None)?;
        self.bus
            .publish(topic, payload, agent.publisher(), agent.metadata())
    }

    pub fn subscribe(
        &self,
        agent: &AgentContext,
        topics: BTreeSet<Topic>,
        filter: Option<SubscriptionFilter>,
    ) -> Result<Subscription> {
        self.authorize(agent, tools::SUBSCRIBE, None)?;
        self.bus.subscribe(&agent.agent_id, topics, filter)
    }

    pub fn update_subscription(
        &self,
        agent: &AgentContext,
        topics: Option<BTreeSet<Topic>>,
        filter: Option<SubscriptionFilter>,
    ) -> Result<Subscription> {
        self.authorize(agent, tools::SUBSCRIBE, None)?;
        self.bus.update_subscription(&agent.agent_id, topics, filter)
    }

    pub fn unsubscribe(&self, agent: &AgentContext) -> Result<bool> {
        self.authorize(agent, tools::SUBSCRIBE, None)?;
        self.bus.unsubscribe(&agent.agent_id)
    }

    pub fn read(&self, agent: &AgentContext, count: usize, topic: Option<Topic>) -> Result<Vec<Message>> {
        self.authorize(agent, tools::SUBSCRIBE, None)?;
        self.bus.read(&agent.agent_id, count, topic)
    }

    pub async fn wait(&self, agent: &AgentContext, timeout: Duration, topic: Option<Topic>) -> Result<Message> {
        self.authorize(agent, tools::SUBSCRIBE, None)?;
        self.bus.wait(&agent.agent_id, timeout, topic).await
    }

    pub fn filter(&self, agent: &AgentContext, filter: &SubscriptionFilter) -> Result<Vec<Message>> {
        self.authorize(agent, tools::SUBSCRIBE, None)?;
        self.bus.filter(&agent.agent_id, filter)
    }

    pub fn subscriptions(&self) -> Result<Vec<Subscription>> {
        self.bus.subscriptions()
    }

    pub fn pending(&self, agent: &AgentContext) -> Result<usize> {
        self.bus.pending(&agent.agent_id)
    }

    pub fn prune(&self, retention: Option<Duration>) -> Result<PruneReport> {
        let retention =
            retention.unwrap_or_else(|| Duration::from_secs(self.config.bus.retention_seconds));
        self.bus.prune(retention)
    }
}
