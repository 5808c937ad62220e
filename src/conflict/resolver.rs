use super::detector::{ConflictDetector, WaitEntry};
use super::merge;
use super::{
    Conflict, ConflictStatus, ConflictSubject, ConflictType, Party, PartyRole, Resolution,
    ResolutionAction, ResolutionStrategy,
};
use crate::bus::{Publisher, Topic};
use crate::clock::{ClockOrdering, VectorClock};
use crate::config::{ConflictConfig, PriorityTable};
use crate::coordinator::AgentContext;
use crate::error::{CoordinationError, Result};
use crate::lease::{LeaseOperation, LeaseRequest};
use crate::state::{ClockedWrite, LockedNamespace, NamespaceStore};
use crate::storage::Storage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Default strategy for one conflict type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub conflict_type: ConflictType,
    pub strategy: ResolutionStrategy,
    pub block_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveFailure {
    pub conflict_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveAllReport {
    pub resolved: Vec<Resolution>,
    pub failed: Vec<ResolveFailure>,
}

/// Side effect a resolution has on leases, tasks or queues.
#[derive(Debug, Clone)]
enum Effect {
    None,
    GrantRequester { evict: Vec<String> },
    Enqueue { entries: Vec<WaitEntry>, rotation: bool, holder_slot: Option<u64> },
    ReassignTask,
    AddCollaborator,
    WaitForTask(WaitEntry),
    WriteState(Value),
}

#[derive(Debug, Clone)]
struct Plan {
    action: ResolutionAction,
    winner: Option<String>,
    losers: Vec<String>,
    merged_value: Option<Value>,
    rotation: Option<Vec<WaitEntry>>,
    effect: Effect,
}

impl Plan {
    fn new(action: ResolutionAction, winner: Option<String>, losers: Vec<String>, effect: Effect) -> Self {
        Self {
            action,
            winner,
            losers,
            merged_value: None,
            rotation: None,
            effect,
        }
    }
}

#[derive(Debug)]
pub struct ConflictResolver {
    storage: Storage,
    detector: Arc<ConflictDetector>,
    store: Arc<NamespaceStore>,
    priorities: PriorityTable,
    config: ConflictConfig,
}

impl ConflictResolver {
    pub fn new(
        storage: Storage,
        detector: Arc<ConflictDetector>,
        store: Arc<NamespaceStore>,
        priorities: PriorityTable,
        config: ConflictConfig,
    ) -> Self {
        Self {
            storage,
            detector,
            store,
            priorities,
            config,
        }
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<ConflictDetector> {
        &self.detector
    }

    pub fn priority(&self, agent_type: &str) -> u32 {
        self.priorities.get(agent_type)
    }

    pub fn rules(&self) -> Vec<Rule> {
        [
            ConflictType::ResourceContention,
            ConflictType::TaskAssignment,
            ConflictType::StateConflict,
        ]
        .into_iter()
        .map(|conflict_type| Rule {
            conflict_type,
            strategy: self.config.rules.strategy_for(conflict_type),
            block_delete: self.config.block_delete,
        })
        .collect()
    }

    /// Strategy the monitor applies to `conflict`.
    pub fn auto_strategy(&self, conflict: &Conflict) -> ResolutionStrategy {
        if self.config.block_delete && conflict.involves_delete() {
            ResolutionStrategy::Block
        } else {
            self.config.rules.strategy_for(conflict.conflict_type)
        }
    }

    pub fn history(&self) -> Result<Vec<Resolution>> {
        self.detector.log().history()
    }

    /// Highest priority wins; on a tie the holder keeps it.
    fn priority_winner<'a>(&self, conflict: &'a Conflict) -> Option<&'a Party> {
        let mut best: Option<&Party> = None;
        for party in conflict.holders().chain(conflict.requester()) {
            match best {
                Some(current) if self.priority(&party.agent_type) <= self.priority(&current.agent_type) => {}
                _ => best = Some(party),
            }
        }
        best
    }

    fn plan(&self, conflict: &Conflict, strategy: ResolutionStrategy) -> Result<Plan> {
        let manual = |reason: String| CoordinationError::ManualResolutionRequired {
            conflict_id: conflict.conflict_id.clone(),
            reason,
        };
        let requester = conflict
            .requester()
            .ok_or_else(|| manual("conflict has no requester".to_string()))?;
        let holder_ids: Vec<String> = conflict.holders().map(|p| p.agent_id.clone()).collect();
        let first_holder = holder_ids.first().cloned();
        let requester_id = requester.agent_id.clone();

        let wait_entry = |slot_seconds: Option<u64>| WaitEntry {
            agent_id: requester.agent_id.clone(),
            agent_type: requester.agent_type.clone(),
            operation: requester.operation,
            slot_seconds,
            enqueued_at: Utc::now(),
        };

        use ConflictType::*;
        use ResolutionStrategy::*;
        let plan = match (conflict.conflict_type, strategy) {
            (_, Block) => Plan::new(ResolutionAction::Blocked, first_holder, vec![requester_id], Effect::None),

            (ResourceContention, AllowBoth) => {
                let all_reads = conflict
                    .parties
                    .iter()
                    .all(|p| p.operation == Some(LeaseOperation::Read));
                if !all_reads {
                    return Err(manual("allow_both only applies to read/read access".to_string()));
                }
                Plan::new(ResolutionAction::BothProceed, None, Vec::new(), Effect::GrantRequester { evict: Vec::new() })
            }

            (_, PriorityBased) => {
                let winner = self
                    .priority_winner(conflict)
                    .ok_or_else(|| manual("conflict has no parties".to_string()))?;
                if winner.role == PartyRole::Holder {
                    Plan::new(ResolutionAction::HolderRetains, Some(winner.agent_id.clone()), vec![requester_id], Effect::None)
                } else {
                    let effect = match conflict.conflict_type {
                        ResourceContention => Effect::GrantRequester { evict: holder_ids.clone() },
                        TaskAssignment => Effect::ReassignTask,
                        StateConflict => Effect::WriteState(requester.value.clone().unwrap_or(Value::Null)),
                    };
                    let mut plan = Plan::new(ResolutionAction::Reassigned, Some(requester_id), holder_ids, effect);
                    if let Effect::WriteState(value) = &plan.effect {
                        plan.merged_value = Some(value.clone());
                    }
                    plan
                }
            }

            (ResourceContention, Sequential) => Plan::new(
                ResolutionAction::Queued,
                first_holder,
                Vec::new(),
                Effect::Enqueue {
                    entries: vec![wait_entry(None)],
                    rotation: false,
                    holder_slot: None,
                },
            ),

            (TaskAssignment, Sequential) => {
                Plan::new(ResolutionAction::Queued, first_holder, Vec::new(), Effect::WaitForTask(wait_entry(None)))
            }

            (ResourceContention, TimeShare) => {
                let slot = self.config.time_share_slot_seconds;
                let mut rotation: Vec<WaitEntry> = conflict
                    .holders()
                    .map(|p| WaitEntry {
                        agent_id: p.agent_id.clone(),
                        agent_type: p.agent_type.clone(),
                        operation: p.operation,
                        slot_seconds: Some(slot),
                        enqueued_at: Utc::now(),
                    })
                    .collect();
                rotation.push(wait_entry(Some(slot)));
                let mut plan = Plan::new(
                    ResolutionAction::RotationScheduled,
                    first_holder,
                    Vec::new(),
                    Effect::Enqueue {
                        entries: vec![wait_entry(Some(slot))],
                        rotation: true,
                        holder_slot: Some(slot),
                    },
                );
                plan.rotation = Some(rotation);
                plan
            }

            (TaskAssignment, Merge) => Plan::new(
                ResolutionAction::CollaboratorAdded,
                first_holder,
                Vec::new(),
                Effect::AddCollaborator,
            ),

            (StateConflict, Merge | MergeLists | SumValues | LatestTimestamp | LastWriteWins) => {
                let ConflictSubject::State { key, .. } = &conflict.subject else {
                    return Err(manual("state conflict without a state subject".to_string()));
                };
                let effective = if strategy == Merge {
                    merge::strategy_for_key(key)
                } else {
                    strategy
                };
                let stored = conflict.holders().next().and_then(|p| p.value.as_ref());
                let proposed = requester.value.clone().unwrap_or(Value::Null);
                let value = merge::combine(effective, stored, &proposed).map_err(|e| manual(e.to_string()))?;
                let mut plan = Plan::new(ResolutionAction::ValueMerged, None, Vec::new(), Effect::WriteState(value.clone()));
                plan.merged_value = Some(value);
                plan
            }

            (conflict_type, strategy) => {
                return Err(manual(format!("{strategy} does not apply to {conflict_type}")));
            }
        };
        Ok(plan)
    }

    /// Write a resolved state value, provided nothing was written to the key
    /// after the clocks the conflict was raised with.
    fn write_state(
        locked: &LockedNamespace<'_>,
        conflict: &Conflict,
        key: &str,
        value: Value,
        resolved_by: &str,
    ) -> Result<()> {
        let manual = |reason: String| CoordinationError::ManualResolutionRequired {
            conflict_id: conflict.conflict_id.clone(),
            reason,
        };
        let basis = conflict
            .parties
            .iter()
            .filter_map(|party| party.clock.as_ref())
            .fold(VectorClock::new(), |acc, clock| acc.merged(clock));

        let stored = locked.key_clock(key)?;
        if !matches!(stored.compare(&basis), ClockOrdering::Before | ClockOrdering::Equal) {
            return Err(manual(format!(
                "{}/{key} was written after the conflict was raised",
                locked.namespace()
            )));
        }
        match locked.set_with_clock(key, value, basis.ticked(resolved_by))? {
            ClockedWrite::Applied { .. } => Ok(()),
            _ => Err(manual(format!("{}/{key} changed while resolving", locked.namespace()))),
        }
    }

    fn apply_effects(&self, conflict: &Conflict, plan: &Plan) -> Result<()> {
        let requester = conflict.requester();
        match (&plan.effect, &conflict.subject, requester) {
            (
                Effect::GrantRequester { evict },
                ConflictSubject::Resource { resource_type, resource_path },
                Some(requester),
            ) => {
                let request = LeaseRequest::resource(
                    resource_type,
                    resource_path,
                    &requester.agent_id,
                    &requester.agent_type,
                    requester.operation.unwrap_or(LeaseOperation::Modify),
                    self.detector.leases().config().default_ttl_seconds,
                );
                self.detector.leases().transfer(&request, evict)?;
            }
            (
                Effect::Enqueue { entries, rotation, holder_slot },
                ConflictSubject::Resource { resource_type, resource_path },
                _,
            ) => {
                if let Some(slot) = holder_slot {
                    for holder in conflict.holders() {
                        let request = LeaseRequest::resource(
                            resource_type,
                            resource_path,
                            &holder.agent_id,
                            &holder.agent_type,
                            holder.operation.unwrap_or(LeaseOperation::Modify),
                            *slot,
                        );
                        self.detector.leases().transfer(&request, &[])?;
                    }
                }
                self.detector
                    .enqueue(resource_type, resource_path, entries.clone(), *rotation)?;
            }
            (Effect::ReassignTask, ConflictSubject::Task { task_id, .. }, Some(requester)) => {
                self.detector.update_task(task_id, |claim| {
                    claim.agent_id = requester.agent_id.clone();
                    claim.agent_type = requester.agent_type.clone();
                    claim.claimed_at = Utc::now();
                    claim.collaborators.retain(|c| c != &requester.agent_id);
                    claim.waiting.retain(|w| w.agent_id != requester.agent_id);
                })?;
            }
            (Effect::AddCollaborator, ConflictSubject::Task { task_id, .. }, Some(requester)) => {
                self.detector.update_task(task_id, |claim| {
                    if !claim.collaborators.contains(&requester.agent_id) {
                        claim.collaborators.push(requester.agent_id.clone());
                    }
                })?;
            }
            (Effect::WaitForTask(entry), ConflictSubject::Task { task_id, .. }, _) => {
                self.detector.update_task(task_id, |claim| {
                    if !claim.waiting.iter().any(|w| w.agent_id == entry.agent_id) {
                        claim.waiting.push(entry.clone());
                    }
                })?;
            }
            _ => {}
        }
        Ok(())
    }

    fn notices(conflict: &Conflict, resolution: &Resolution) -> Map<String, Value> {
        let mut notices = Map::new();
        for party in &conflict.parties {
            let is_requester = party.role == PartyRole::Requester;
            let notice = match resolution.action {
                ResolutionAction::Reassigned if resolution.winner.as_deref() == Some(&party.agent_id) => "granted",
                ResolutionAction::Reassigned => "preempted",
                ResolutionAction::HolderRetains | ResolutionAction::Blocked if is_requester => "denied",
                ResolutionAction::HolderRetains | ResolutionAction::Blocked => "retained",
                ResolutionAction::Queued if is_requester => "queued",
                ResolutionAction::Queued => "retained",
                ResolutionAction::BothProceed => "granted",
                ResolutionAction::CollaboratorAdded if is_requester => "collaborator",
                ResolutionAction::CollaboratorAdded => "retained",
                ResolutionAction::ValueMerged => "merged",
                ResolutionAction::RotationScheduled => "rotation",
            };
            notices.insert(party.agent_id.clone(), json!(notice));
        }
        notices
    }

    /// Apply `plan` and mark the conflict resolved under its guard. `write`
    /// runs first, against the conflict as re-read inside the guard.
    fn settle(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        plan: &Plan,
        resolved_by: &str,
        write: impl FnOnce(&Conflict) -> Result<()>,
    ) -> Result<(Resolution, bool)> {
        self.storage.with_guard(&format!("conflict:{conflict_id}"), || {
            let mut current = self.detector.log().get(conflict_id)?;
            if let Some(existing) = &current.resolution {
                return Ok((existing.clone(), false));
            }
            write(&current)?;
            self.apply_effects(&current, plan)?;
            let resolution = Resolution {
                conflict_id: conflict_id.to_string(),
                strategy,
                action: plan.action,
                winner: plan.winner.clone(),
                losers: plan.losers.clone(),
                merged_value: plan.merged_value.clone(),
                rotation: plan.rotation.clone(),
                resolved_by: resolved_by.to_string(),
                timestamp: Utc::now(),
            };
            self.detector.log().mark_resolved(&mut current, resolution.clone())?;
            Ok((resolution, true))
        })
    }

    /// Resolve `conflict_id` with `strategy`. Resolving a resolved conflict
    /// returns the stored resolution without touching anything.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        resolved_by: &str,
    ) -> Result<Resolution> {
        let conflict = self.detector.log().get(conflict_id)?;
        if let Some(resolution) = &conflict.resolution {
            return Ok(resolution.clone());
        }

        let plan = self.plan(&conflict, strategy)?;
        let (resolution, fresh) = match (&plan.effect, &conflict.subject) {
            (Effect::WriteState(value), ConflictSubject::State { namespace, key }) => {
                let agent = AgentContext::new(resolved_by, "resolver");
                self.store
                    .locked(namespace, &agent, |locked| {
                        self.settle(conflict_id, strategy, &plan, resolved_by, |current| {
                            Self::write_state(locked, current, key, value.clone(), resolved_by)
                        })
                    })
                    .await?
            }
            _ => self.settle(conflict_id, strategy, &plan, resolved_by, |_| Ok(()))?,
        };

        if fresh {
            info!(
                conflict_id = %conflict_id,
                strategy = %strategy,
                action = %resolution.action,
                winner = ?resolution.winner,
                resolved_by = %resolved_by,
                "conflict resolved"
            );
            self.detector.publish(
                Topic::Coordination,
                json!({
                    "event": "conflict_resolved",
                    "conflict_id": conflict_id,
                    "subject": conflict.subject,
                    "strategy": strategy,
                    "action": resolution.action,
                    "winner": resolution.winner,
                    "losers": resolution.losers,
                    "notices": Self::notices(&conflict, &resolution),
                }),
                Publisher::new("resolver", resolved_by),
            );
        }
        Ok(resolution)
    }

    /// Resolve every active conflict, optionally of one type. `None` uses
    /// each conflict's automatic strategy.
    pub async fn resolve_all(
        &self,
        strategy: Option<ResolutionStrategy>,
        type_filter: Option<ConflictType>,
        resolved_by: &str,
    ) -> Result<ResolveAllReport> {
        let mut report = ResolveAllReport::default();
        let active = self.detector.log().list(Some(ConflictStatus::Active))?;

        for conflict in active
            .iter()
            .filter(|c| type_filter.map_or(true, |t| t == c.conflict_type))
        {
            let chosen = strategy.unwrap_or_else(|| self.auto_strategy(conflict));
            match self.resolve(&conflict.conflict_id, chosen, resolved_by).await {
                Ok(resolution) => report.resolved.push(resolution),
                Err(e) if e.is_recoverable() => {
                    warn!(conflict_id = %conflict.conflict_id, error = %e, "conflict left active");
                    report.failed.push(ResolveFailure {
                        conflict_id: conflict.conflict_id.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ClaimOutcome;
    use crate::config::LockConfig;
    use crate::lease::LeaseManager;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        detector: Arc<ConflictDetector>,
        resolver: ConflictResolver,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let leases = Arc::new(LeaseManager::new(storage.clone(), LockConfig::default()));
        let detector = Arc::new(ConflictDetector::new(storage.clone(), leases.clone(), LockConfig::default()));
        let store = Arc::new(NamespaceStore::new(storage.clone(), leases, LockConfig::default()));
        let resolver = ConflictResolver::new(
            storage,
            detector.clone(),
            store,
            PriorityTable::default(),
            ConflictConfig::default(),
        );
        Fixture {
            _dir: dir,
            detector,
            resolver,
        }
    }

    fn contend(f: &Fixture, holder: &AgentContext, requester: &AgentContext, op: LeaseOperation) -> Conflict {
        f.detector
            .claim_resource("file", "/app.js", holder, LeaseOperation::Modify, None)
            .unwrap();
        match f.detector.claim_resource("file", "/app.js", requester, op, None).unwrap() {
            ClaimOutcome::Conflict(conflict) => conflict,
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_higher_priority_requester_takes_resource() {
        let f = fixture();
        let coder = AgentContext::new("c1", "coder");
        let boss = AgentContext::new("o1", "orchestrator");
        let conflict = contend(&f, &coder, &boss, LeaseOperation::Modify);

        let resolution = f
            .resolver
            .resolve(&conflict.conflict_id, ResolutionStrategy::PriorityBased, "test")
            .await
            .unwrap();
        assert_eq!(resolution.winner.as_deref(), Some("o1"));
        assert_eq!(resolution.action, ResolutionAction::Reassigned);

        let record = f.detector.leases().inspect("resource:file:/app.js").unwrap().unwrap();
        assert_eq!(record.holders.len(), 1);
        assert_eq!(record.holders[0].holder, "o1");
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let f = fixture();
        let a = AgentContext::new("a", "coder");
        let b = AgentContext::new("b", "coder");
        let conflict = contend(&f, &a, &b, LeaseOperation::Modify);

        let first = f
            .resolver
            .resolve(&conflict.conflict_id, ResolutionStrategy::Sequential, "test")
            .await
            .unwrap();
        let second = f
            .resolver
            .resolve(&conflict.conflict_id, ResolutionStrategy::PriorityBased, "someone-else")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(f.resolver.history().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_allow_both_on_writes_needs_manual_resolution() {
        let f = fixture();
        let a = AgentContext::new("a", "coder");
        let b = AgentContext::new("b", "coder");
        let conflict = contend(&f, &a, &b, LeaseOperation::Modify);

        let err = f
            .resolver
            .resolve(&conflict.conflict_id, ResolutionStrategy::AllowBoth, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::ManualResolutionRequired { .. }));
        let still = f.detector.log().get(&conflict.conflict_id).unwrap();
        assert_eq!(still.status, ConflictStatus::Active);
    }

    #[tokio::test]
    async fn test_auto_strategy_blocks_deletes() {
        let f = fixture();
        let a = AgentContext::new("a", "coder");
        let b = AgentContext::new("b", "orchestrator");
        let conflict = contend(&f, &a, &b, LeaseOperation::Delete);

        assert_eq!(f.resolver.auto_strategy(&conflict), ResolutionStrategy::Block);
        let report = f.resolver.resolve_all(None, None, "monitor").await.unwrap();
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.resolved[0].action, ResolutionAction::Blocked);
        assert_eq!(report.resolved[0].losers, vec!["b".to_string()]);
    }

    #[test]
    fn test_rules_cover_every_conflict_type() {
        let f = fixture();
        let rules = f.resolver.rules();
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.block_delete));
        assert_eq!(f.resolver.priority("architect"), 90);
    }
}
