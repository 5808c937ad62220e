use super::{Conflict, ConflictLog, ConflictSubject, ConflictType, Party, PartyRole, Severity};
use crate::bus::{MessageBus, MessageMetadata, Publisher, Topic};
use crate::clock::VectorClock;
use crate::config::LockConfig;
use crate::coordinator::AgentContext;
use crate::error::Result;
use crate::lease::{resource_key, AcquireAttempt, Lease, LeaseManager, LeaseOperation, LeaseRecord, LeaseRequest};
use crate::storage::{file_key, Storage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a claim: granted, or a recorded conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum ClaimOutcome<T> {
    Granted(T),
    Conflict(Conflict),
}

impl<T> ClaimOutcome<T> {
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimOutcome::Granted(_))
    }

    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            ClaimOutcome::Conflict(conflict) => Some(conflict),
            ClaimOutcome::Granted(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskClaim {
    pub task_id: String,
    pub task_type: String,
    pub agent_id: String,
    pub agent_type: String,
    pub claimed_at: DateTime<Utc>,
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(default)]
    pub waiting: Vec<WaitEntry>,
}

/// An agent waiting for a resource or task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEntry {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<LeaseOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_seconds: Option<u64>,
    pub enqueued_at: DateTime<Utc>,
}

/// FIFO of agents waiting for one resource. A rotation re-enqueues each
/// holder at the back when its slot expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitQueue {
    pub key: String,
    pub resource_type: String,
    pub resource_path: String,
    pub entries: Vec<WaitEntry>,
    #[serde(default)]
    pub rotation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Release<T> {
    pub released: bool,
    pub handed_to: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Claims {
    pub resources: Vec<LeaseRecord>,
    pub tasks: Vec<TaskClaim>,
    pub queues: Vec<WaitQueue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub expired: Vec<Lease>,
    pub handoffs: Vec<Lease>,
}

#[derive(Debug)]
pub struct ConflictDetector {
    storage: Storage,
    leases: Arc<LeaseManager>,
    log: ConflictLog,
    bus: Option<Arc<MessageBus>>,
    config: LockConfig,
}

impl ConflictDetector {
    pub fn new(storage: Storage, leases: Arc<LeaseManager>, config: LockConfig) -> Self {
        Self {
            log: ConflictLog::new(storage.clone()),
            storage,
            leases,
            bus: None,
            config,
        }
    }

    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn log(&self) -> &ConflictLog {
        &self.log
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.storage
            .path(&["tasks", &format!("{}.json", file_key(task_id))])
    }

    fn queue_path(&self, key: &str) -> PathBuf {
        self.storage
            .path(&["queues", &format!("{}.json", file_key(key))])
    }

    fn queue_guard(key: &str) -> String {
        format!("queue:{key}")
    }

    fn task_guard(task_id: &str) -> String {
        format!("task:{task_id}")
    }

    pub(crate) fn publish(&self, topic: Topic, payload: Value, publisher: Publisher) {
        let Some(bus) = &self.bus else {
            return;
        };
        if let Err(e) = bus.publish(topic, payload, publisher, MessageMetadata::default()) {
            warn!(topic = %topic, error = %e, "coordination message not published");
        }
    }

    /// Record a new conflict, or return the active one already raised by the
    /// same requester on the same subject.
    fn raise(&self, conflict: Conflict, requester: &AgentContext) -> Result<Conflict> {
        let existing = self.storage.with_guard("conflict-log", || {
            match self.log.find_active(&conflict.subject, &requester.agent_id)? {
                Some(existing) => Ok(Some(existing)),
                None => self.log.record(&conflict).map(|()| None),
            }
        })?;
        if let Some(existing) = existing {
            return Ok(existing);
        }
        warn!(
            conflict_id = %conflict.conflict_id,
            conflict_type = %conflict.conflict_type,
            severity = %conflict.severity,
            subject = %conflict.subject.key(),
            "conflict detected"
        );
        self.publish(
            Topic::Conflict,
            json!({
                "event": "conflict_detected",
                "conflict_id": conflict.conflict_id,
                "conflict_type": conflict.conflict_type,
                "severity": conflict.severity,
                "subject": conflict.subject,
                "agents": conflict.agent_ids(),
            }),
            Publisher::new(&requester.agent_type, &requester.agent_id),
        );
        Ok(conflict)
    }

    /// Claim `resource_type:resource_path` for `operation`.
    pub fn claim_resource(
        &self,
        resource_type: &str,
        resource_path: &str,
        agent: &AgentContext,
        operation: LeaseOperation,
        ttl_seconds: Option<u64>,
    ) -> Result<ClaimOutcome<Lease>> {
        let request = LeaseRequest::resource(
            resource_type,
            resource_path,
            &agent.agent_id,
            &agent.agent_type,
            operation,
            ttl_seconds.unwrap_or(self.config.default_ttl_seconds),
        );

        match self.leases.try_acquire(&request)? {
            AcquireAttempt::Granted(lease) => {
                if let Some(previous) = &lease.reclaimed_from {
                    info!(key = %lease.key, previous_holder = %previous, "abandoned claim granted to new holder");
                }
                self.leave_queue(&request.key, &agent.agent_id, false)?;
                Ok(ClaimOutcome::Granted(lease))
            }
            AcquireAttempt::Held { holders } => {
                let severity = if operation == LeaseOperation::Delete
                    || holders.iter().any(|l| l.operation == LeaseOperation::Delete)
                {
                    Severity::Critical
                } else {
                    Severity::High
                };
                let mut parties: Vec<Party> = holders
                    .iter()
                    .map(|l| Party {
                        agent_id: l.holder.clone(),
                        agent_type: l.holder_type.clone(),
                        role: PartyRole::Holder,
                        operation: Some(l.operation),
                        value: None,
                        clock: None,
                    })
                    .collect();
                parties.push(Party {
                    agent_id: agent.agent_id.clone(),
                    agent_type: agent.agent_type.clone(),
                    role: PartyRole::Requester,
                    operation: Some(operation),
                    value: None,
                    clock: None,
                });
                let conflict = Conflict::new(
                    ConflictType::ResourceContention,
                    severity,
                    ConflictSubject::Resource {
                        resource_type: resource_type.to_string(),
                        resource_path: resource_path.to_string(),
                    },
                    parties,
                );
                Ok(ClaimOutcome::Conflict(self.raise(conflict, agent)?))
            }
        }
    }

    /// Claim a task; a task held by another agent is always a conflict.
    pub fn claim_task(
        &self,
        task_id: &str,
        task_type: &str,
        agent: &AgentContext,
    ) -> Result<ClaimOutcome<TaskClaim>> {
        let path = self.task_path(task_id);
        let attempt = self.storage.with_guard(&Self::task_guard(task_id), || {
            match self.storage.read_json::<TaskClaim>(&path)? {
                Some(current) if current.agent_id != agent.agent_id => Ok(Err(current)),
                current => {
                    let (claimed_at, collaborators, waiting) = match current {
                        Some(c) => (c.claimed_at, c.collaborators, c.waiting),
                        None => (Utc::now(), Vec::new(), Vec::new()),
                    };
                    let claim = TaskClaim {
                        task_id: task_id.to_string(),
                        task_type: task_type.to_string(),
                        agent_id: agent.agent_id.clone(),
                        agent_type: agent.agent_type.clone(),
                        claimed_at,
                        collaborators,
                        waiting,
                    };
                    self.storage.write_json_atomic(&path, &claim)?;
                    Ok(Ok(claim))
                }
            }
        })?;

        let current = match attempt {
            Ok(claim) => {
                info!(task_id = %task_id, agent_id = %agent.agent_id, "task claimed");
                return Ok(ClaimOutcome::Granted(claim));
            }
            Err(current) => current,
        };

        let parties = vec![
            Party {
                agent_id: current.agent_id.clone(),
                agent_type: current.agent_type.clone(),
                role: PartyRole::Holder,
                operation: None,
                value: None,
                clock: None,
            },
            Party {
                agent_id: agent.agent_id.clone(),
                agent_type: agent.agent_type.clone(),
                role: PartyRole::Requester,
                operation: None,
                value: None,
                clock: None,
            },
        ];
        let conflict = Conflict::new(
            ConflictType::TaskAssignment,
            Severity::Medium,
            ConflictSubject::Task {
                task_id: task_id.to_string(),
                task_type: task_type.to_string(),
            },
            parties,
        );
        Ok(ClaimOutcome::Conflict(self.raise(conflict, agent)?))
    }

    /// Record a concurrent write on `namespace/key`.
    #[allow(clippy::too_many_arguments)]
    pub fn record_state_conflict(
        &self,
        namespace: &str,
        key: &str,
        writer: &AgentContext,
        current: Option<Value>,
        stored: VectorClock,
        last_writer: Option<String>,
        proposed_value: Value,
        proposed: VectorClock,
    ) -> Result<Conflict> {
        let parties = vec![
            Party {
                agent_id: last_writer.unwrap_or_else(|| "unknown".to_string()),
                agent_type: "unknown".to_string(),
                role: PartyRole::Holder,
                operation: Some(LeaseOperation::Modify),
                value: current,
                clock: Some(stored),
            },
            Party {
                agent_id: writer.agent_id.clone(),
                agent_type: writer.agent_type.clone(),
                role: PartyRole::Requester,
                operation: Some(LeaseOperation::Modify),
                value: Some(proposed_value),
                clock: Some(proposed),
            },
        ];
        let conflict = Conflict::new(
            ConflictType::StateConflict,
            Severity::High,
            ConflictSubject::State {
                namespace: namespace.to_string(),
                key: key.to_string(),
            },
            parties,
        );
        self.log.record(&conflict)?;
        warn!(conflict_id = %conflict.conflict_id, namespace = %namespace, key = %key, "concurrent state write");
        self.publish(
            Topic::Conflict,
            json!({
                "event": "conflict_detected",
                "conflict_id": conflict.conflict_id,
                "conflict_type": conflict.conflict_type,
                "severity": conflict.severity,
                "subject": conflict.subject,
                "agents": conflict.agent_ids(),
            }),
            Publisher::new(&writer.agent_type, &writer.agent_id),
        );
        Ok(conflict)
    }

    pub fn task(&self, task_id: &str) -> Result<Option<TaskClaim>> {
        self.storage.read_json(&self.task_path(task_id))
    }

    /// Read-modify-write a task claim under its guard.
    pub(crate) fn update_task<T>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut TaskClaim) -> T,
    ) -> Result<T> {
        let path = self.task_path(task_id);
        self.storage.with_guard(&Self::task_guard(task_id), || {
            let mut claim: TaskClaim = self
                .storage
                .read_json(&path)?
                .ok_or_else(|| crate::error::CoordinationError::not_found("task", task_id))?;
            let out = f(&mut claim);
            self.storage.write_json_atomic(&path, &claim)?;
            Ok(out)
        })
    }

    /// Release a task. The assignee hands it to the first waiter; a
    /// collaborator just leaves.
    pub fn release_task(&self, task_id: &str, agent_id: &str) -> Result<Release<TaskClaim>> {
        let path = self.task_path(task_id);
        let outcome = self.storage.with_guard(&Self::task_guard(task_id), || {
            let Some(mut claim) = self.storage.read_json::<TaskClaim>(&path)? else {
                return Ok(Release {
                    released: false,
                    handed_to: None,
                });
            };

            if claim.agent_id != agent_id {
                let before = claim.collaborators.len() + claim.waiting.len();
                claim.collaborators.retain(|c| c != agent_id);
                claim.waiting.retain(|w| w.agent_id != agent_id);
                let released = before != claim.collaborators.len() + claim.waiting.len();
                if released {
                    self.storage.write_json_atomic(&path, &claim)?;
                }
                return Ok(Release {
                    released,
                    handed_to: None,
                });
            }

            if claim.waiting.is_empty() {
                self.storage.remove(&path)?;
                return Ok(Release {
                    released: true,
                    handed_to: None,
                });
            }

            let next = claim.waiting.remove(0);
            claim.agent_id = next.agent_id;
            claim.agent_type = next.agent_type;
            claim.claimed_at = Utc::now();
            claim.collaborators.retain(|c| c != &claim.agent_id);
            self.storage.write_json_atomic(&path, &claim)?;
            Ok(Release {
                released: true,
                handed_to: Some(claim),
            })
        })?;

        if outcome.released {
            info!(task_id = %task_id, agent_id = %agent_id, "task released");
        }
        if let Some(next) = &outcome.handed_to {
            self.publish(
                Topic::Task,
                json!({"event": "task_handoff", "task_id": task_id, "agent_id": next.agent_id}),
                Publisher::system(),
            );
        }
        Ok(outcome)
    }

    pub fn queue(&self, key: &str) -> Result<Option<WaitQueue>> {
        self.storage.read_json(&self.queue_path(key))
    }

    /// Append waiters to the queue of `resource_type:resource_path`.
    pub(crate) fn enqueue(
        &self,
        resource_type: &str,
        resource_path: &str,
        waiters: Vec<WaitEntry>,
        rotation: bool,
    ) -> Result<WaitQueue> {
        let key = resource_key(resource_type, resource_path);
        let path = self.queue_path(&key);
        self.storage.with_guard(&Self::queue_guard(&key), || {
            let mut queue = self.storage.read_json::<WaitQueue>(&path)?.unwrap_or(WaitQueue {
                key: key.clone(),
                resource_type: resource_type.to_string(),
                resource_path: resource_path.to_string(),
                entries: Vec::new(),
                rotation,
            });
            queue.rotation |= rotation;
            for waiter in waiters {
                if !queue.entries.iter().any(|e| e.agent_id == waiter.agent_id) {
                    queue.entries.push(waiter);
                }
            }
            self.storage.write_json_atomic(&path, &queue)?;
            Ok(queue)
        })
    }

    /// Remove `agent_id` from a queue. Rotation members stay unless
    /// `include_rotation` is set.
    fn leave_queue(&self, key: &str, agent_id: &str, include_rotation: bool) -> Result<()> {
        let path = self.queue_path(key);
        self.storage.with_guard(&Self::queue_guard(key), || {
            let Some(mut queue) = self.storage.read_json::<WaitQueue>(&path)? else {
                return Ok(());
            };
            if queue.rotation && !include_rotation {
                return Ok(());
            }
            let before = queue.entries.len();
            queue.entries.retain(|e| e.agent_id != agent_id);
            if queue.entries.len() == before {
                return Ok(());
            }
            if queue.entries.is_empty() {
                self.storage.remove(&path)?;
            } else {
                self.storage.write_json_atomic(&path, &queue)?;
            }
            Ok(())
        })
    }

    /// Grant the resource to the queue head if nobody incompatible holds it.
    fn hand_off(&self, key: &str) -> Result<Option<Lease>> {
        let path = self.queue_path(key);
        let granted = self.storage.with_guard(&Self::queue_guard(key), || {
            let Some(mut queue) = self.storage.read_json::<WaitQueue>(&path)? else {
                return Ok(None);
            };
            let Some(head) = queue.entries.first().cloned() else {
                self.storage.remove(&path)?;
                return Ok(None);
            };

            let operation = head.operation.unwrap_or(LeaseOperation::Modify);
            let holders = self
                .leases
                .inspect(key)?
                .map(|r| r.holders)
                .unwrap_or_default();
            if holders
                .iter()
                .any(|l| l.holder != head.agent_id && !l.operation.compatible(operation))
            {
                return Ok(None);
            }

            let request = LeaseRequest::resource(
                &queue.resource_type,
                &queue.resource_path,
                &head.agent_id,
                &head.agent_type,
                operation,
                head.slot_seconds.unwrap_or(self.config.default_ttl_seconds),
            );
            let lease = self.leases.transfer(&request, &[])?;

            queue.entries.remove(0);
            if queue.rotation {
                let mut rejoin = head;
                rejoin.enqueued_at = Utc::now();
                queue.entries.push(rejoin);
            }
            if queue.entries.is_empty() {
                self.storage.remove(&path)?;
            } else {
                self.storage.write_json_atomic(&path, &queue)?;
            }
            Ok(Some(lease))
        })?;

        if let Some(lease) = &granted {
            info!(key = %key, holder = %lease.holder, "resource handed to next waiter");
            self.publish(
                Topic::Coordination,
                json!({
                    "event": "resource_handoff",
                    "key": key,
                    "agent_id": lease.holder,
                    "lease_id": lease.lease_id,
                    "operation": lease.operation,
                }),
                Publisher::system(),
            );
        }
        Ok(granted)
    }

    /// Release `agent`'s claim and pass the resource to the next waiter.
    /// Releasing also withdraws the agent from the resource's queue.
    pub fn release_resource(
        &self,
        resource_type: &str,
        resource_path: &str,
        agent_id: &str,
    ) -> Result<Release<Lease>> {
        let key = resource_key(resource_type, resource_path);
        let released = self.leases.release(&key, agent_id)?;
        self.leave_queue(&key, agent_id, true)?;
        let handed_to = if released { self.hand_off(&key)? } else { None };
        Ok(Release {
            released,
            handed_to,
        })
    }

    pub fn queues(&self) -> Result<Vec<WaitQueue>> {
        let dir = self.storage.path(&["queues"]);
        let mut queues = Vec::new();
        for path in self.storage.list_files(&dir, "json")? {
            if let Some(queue) = self.storage.read_json(&path)? {
                queues.push(queue);
            }
        }
        Ok(queues)
    }

    pub fn tasks(&self) -> Result<Vec<TaskClaim>> {
        let dir = self.storage.path(&["tasks"]);
        let mut tasks = Vec::new();
        for path in self.storage.list_files(&dir, "json")? {
            if let Some(task) = self.storage.read_json(&path)? {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a: &TaskClaim, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }

    /// Current resource leases (namespace leases excluded), tasks and queues.
    pub fn list_claims(&self) -> Result<Claims> {
        let resources = self
            .leases
            .list()?
            .into_iter()
            .filter(|r| r.key.starts_with("resource:"))
            .collect();
        Ok(Claims {
            resources,
            tasks: self.tasks()?,
            queues: self.queues()?,
        })
    }

    /// Drop expired leases, rotate time-share holders whose slot ended and
    /// hand free resources to their queues.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        let expired = self.leases.cleanup()?;
        let mut report = CleanupReport {
            expired,
            handoffs: Vec::new(),
        };

        for queue in self.queues()? {
            if queue.rotation {
                let rejoin: Vec<WaitEntry> = report
                    .expired
                    .iter()
                    .filter(|l| l.key == queue.key)
                    .map(|l| WaitEntry {
                        agent_id: l.holder.clone(),
                        agent_type: l.holder_type.clone(),
                        operation: Some(l.operation),
                        slot_seconds: Some(l.ttl_seconds),
                        enqueued_at: Utc::now(),
                    })
                    .collect();
                if !rejoin.is_empty() {
                    self.enqueue(&queue.resource_type, &queue.resource_path, rejoin, true)?;
                }
            }
            if let Some(lease) = self.hand_off(&queue.key)? {
                report.handoffs.push(lease);
            }
        }
        Ok(report)
    }
}
