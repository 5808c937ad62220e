//! Conflict records and their persistence.
//!
//! A conflict is created active by the detector, receives exactly one
//! resolution from the resolver and then moves to `conflicts/resolved/`.
//! Resolutions are also appended to `conflicts/resolutions.jsonl`.

pub mod detector;
pub mod merge;
pub mod monitor;
pub mod resolver;

pub use detector::{ClaimOutcome, Claims, CleanupReport, ConflictDetector, Release, TaskClaim, WaitEntry, WaitQueue};
pub use monitor::{ConflictMonitor, MonitorReport};
pub use resolver::{ConflictResolver, ResolveAllReport, ResolveFailure, Rule};

use crate::clock::VectorClock;
use crate::error::{CoordinationError, Result};
use crate::lease::LeaseOperation;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ResourceContention,
    TaskAssignment,
    StateConflict,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::ResourceContention => write!(f, "resource_contention"),
            ConflictType::TaskAssignment => write!(f, "task_assignment"),
            ConflictType::StateConflict => write!(f, "state_conflict"),
        }
    }
}

impl FromStr for ConflictType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "resource_contention" | "resource" => Ok(ConflictType::ResourceContention),
            "task_assignment" | "task" => Ok(ConflictType::TaskAssignment),
            "state_conflict" | "state" => Ok(ConflictType::StateConflict),
            other => Err(CoordinationError::validation(format!("unknown conflict type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Active,
    Resolved,
}

impl FromStr for ConflictStatus {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ConflictStatus::Active),
            "resolved" => Ok(ConflictStatus::Resolved),
            other => Err(CoordinationError::validation(format!("unknown conflict status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    AllowBoth,
    PriorityBased,
    Sequential,
    Merge,
    MergeLists,
    SumValues,
    LatestTimestamp,
    LastWriteWins,
    Block,
    TimeShare,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionStrategy::AllowBoth => "allow_both",
            ResolutionStrategy::PriorityBased => "priority_based",
            ResolutionStrategy::Sequential => "sequential",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::MergeLists => "merge_lists",
            ResolutionStrategy::SumValues => "sum_values",
            ResolutionStrategy::LatestTimestamp => "latest_timestamp",
            ResolutionStrategy::LastWriteWins => "last_write_wins",
            ResolutionStrategy::Block => "block",
            ResolutionStrategy::TimeShare => "time_share",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ResolutionStrategy {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "allow_both" => Ok(ResolutionStrategy::AllowBoth),
            "priority_based" | "priority" => Ok(ResolutionStrategy::PriorityBased),
            "sequential" => Ok(ResolutionStrategy::Sequential),
            "merge" => Ok(ResolutionStrategy::Merge),
            "merge_lists" => Ok(ResolutionStrategy::MergeLists),
            "sum_values" => Ok(ResolutionStrategy::SumValues),
            "latest_timestamp" => Ok(ResolutionStrategy::LatestTimestamp),
            "last_write_wins" => Ok(ResolutionStrategy::LastWriteWins),
            "block" => Ok(ResolutionStrategy::Block),
            "time_share" => Ok(ResolutionStrategy::TimeShare),
            other => Err(CoordinationError::validation(format!("unknown strategy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Holder,
    Requester,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub agent_id: String,
    pub agent_type: String,
    pub role: PartyRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<LeaseOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<VectorClock>,
}

/// What a conflict is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictSubject {
    Resource {
        resource_type: String,
        resource_path: String,
    },
    Task {
        task_id: String,
        task_type: String,
    },
    State {
        namespace: String,
        key: String,
    },
}

impl ConflictSubject {
    pub fn key(&self) -> String {
        match self {
            ConflictSubject::Resource {
                resource_type,
                resource_path,
            } => crate::lease::resource_key(resource_type, resource_path),
            ConflictSubject::Task { task_id, .. } => format!("task:{task_id}"),
            ConflictSubject::State { namespace, key } => format!("state:{namespace}/{key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    BothProceed,
    HolderRetains,
    Reassigned,
    Queued,
    CollaboratorAdded,
    ValueMerged,
    Blocked,
    RotationScheduled,
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionAction::BothProceed => "both_proceed",
            ResolutionAction::HolderRetains => "holder_retains",
            ResolutionAction::Reassigned => "reassigned",
            ResolutionAction::Queued => "queued",
            ResolutionAction::CollaboratorAdded => "collaborator_added",
            ResolutionAction::ValueMerged => "value_merged",
            ResolutionAction::Blocked => "blocked",
            ResolutionAction::RotationScheduled => "rotation_scheduled",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub conflict_id: String,
    pub strategy: ResolutionStrategy,
    pub action: ResolutionAction,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub losers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Vec<WaitEntry>>,
    pub resolved_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub subject: ConflictSubject,
    pub parties: Vec<Party>,
    pub created_at: DateTime<Utc>,
    pub status: ConflictStatus,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl Conflict {
    pub fn new(
        conflict_type: ConflictType,
        severity: Severity,
        subject: ConflictSubject,
        parties: Vec<Party>,
    ) -> Self {
        let created_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            conflict_id: format!("conflict-{}-{}", created_at.format("%Y%m%d%H%M%S"), &suffix[..8]),
            conflict_type,
            severity,
            subject,
            parties,
            created_at,
            status: ConflictStatus::Active,
            resolution: None,
        }
    }

    pub fn holders(&self) -> impl Iterator<Item = &Party> {
        self.parties.iter().filter(|p| p.role == PartyRole::Holder)
    }

    pub fn requester(&self) -> Option<&Party> {
        self.parties.iter().find(|p| p.role == PartyRole::Requester)
    }

    pub fn involves_delete(&self) -> bool {
        self.parties
            .iter()
            .any(|p| p.operation == Some(LeaseOperation::Delete))
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.parties.iter().map(|p| p.agent_id.clone()).collect()
    }
}

/// Active/resolved conflict records and the resolution history.
#[derive(Debug, Clone)]
pub struct ConflictLog {
    storage: Storage,
}

impl ConflictLog {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn active_path(&self, conflict_id: &str) -> PathBuf {
        self.storage
            .path(&["conflicts", "active", &format!("{conflict_id}.json")])
    }

    fn resolved_path(&self, conflict_id: &str) -> PathBuf {
        self.storage
            .path(&["conflicts", "resolved", &format!("{conflict_id}.json")])
    }

    fn history_path(&self) -> PathBuf {
        self.storage.path(&["conflicts", "resolutions.jsonl"])
    }

    pub fn record(&self, conflict: &Conflict) -> Result<()> {
        self.storage
            .write_json_atomic(&self.active_path(&conflict.conflict_id), conflict)
    }

    /// Resolved record wins when both exist.
    pub fn get(&self, conflict_id: &str) -> Result<Conflict> {
        if let Some(conflict) = self.storage.read_json(&self.resolved_path(conflict_id))? {
            return Ok(conflict);
        }
        self.storage
            .read_json(&self.active_path(conflict_id))?
            .ok_or_else(|| CoordinationError::not_found("conflict", conflict_id))
    }

    pub fn list(&self, status: Option<ConflictStatus>) -> Result<Vec<Conflict>> {
        let mut conflicts = Vec::new();
        if status != Some(ConflictStatus::Resolved) {
            let dir = self.storage.path(&["conflicts", "active"]);
            for path in self.storage.list_files(&dir, "json")? {
                if let Some(conflict) = self.storage.read_json::<Conflict>(&path)? {
                    if !self.resolved_path(&conflict.conflict_id).exists() {
                        conflicts.push(conflict);
                    }
                }
            }
        }
        if status != Some(ConflictStatus::Active) {
            let dir = self.storage.path(&["conflicts", "resolved"]);
            for path in self.storage.list_files(&dir, "json")? {
                if let Some(conflict) = self.storage.read_json::<Conflict>(&path)? {
                    conflicts.push(conflict);
                }
            }
        }
        conflicts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(conflicts)
    }

    /// Active conflict on the same subject raised by the same requester.
    pub fn find_active(&self, subject: &ConflictSubject, requester: &str) -> Result<Option<Conflict>> {
        Ok(self
            .list(Some(ConflictStatus::Active))?
            .into_iter()
            .find(|c| &c.subject == subject && c.requester().is_some_and(|p| p.agent_id == requester)))
    }

    /// Persist the resolved record, drop the active one and append history.
    pub fn mark_resolved(&self, conflict: &mut Conflict, resolution: Resolution) -> Result<()> {
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution.clone());
        self.storage
            .write_json_atomic(&self.resolved_path(&conflict.conflict_id), conflict)?;
        self.storage.remove(&self.active_path(&conflict.conflict_id))?;
        self.storage.append_jsonl(&self.history_path(), &resolution)
    }

    pub fn history(&self) -> Result<Vec<Resolution>> {
        self.storage.read_jsonl(&self.history_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn party(agent: &str, role: PartyRole, op: LeaseOperation) -> Party {
        Party {
            agent_id: agent.to_string(),
            agent_type: "coder".to_string(),
            role,
            operation: Some(op),
            value: None,
            clock: None,
        }
    }

    fn resource_conflict() -> Conflict {
        Conflict::new(
            ConflictType::ResourceContention,
            Severity::High,
            ConflictSubject::Resource {
                resource_type: "file".to_string(),
                resource_path: "/app.js".to_string(),
            },
            vec![
                party("a", PartyRole::Holder, LeaseOperation::Modify),
                party("b", PartyRole::Requester, LeaseOperation::Modify),
            ],
        )
    }

    #[test]
    fn test_strategy_names_accept_hyphens() {
        assert_eq!("merge-lists".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::MergeLists);
        assert_eq!("priority_based".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::PriorityBased);
        assert_eq!(ResolutionStrategy::TimeShare.to_string(), "time_share");
        assert!("coin-flip".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn test_subject_keys() {
        let conflict = resource_conflict();
        assert_eq!(conflict.subject.key(), "resource:file:/app.js");
        assert_eq!(conflict.requester().unwrap().agent_id, "b");
        assert!(!conflict.involves_delete());
    }

    #[test]
    fn test_log_moves_conflict_to_resolved() {
        let dir = TempDir::new().unwrap();
        let log = ConflictLog::new(Storage::new(dir.path()));
        let mut conflict = resource_conflict();
        log.record(&conflict).unwrap();
        assert_eq!(log.list(Some(ConflictStatus::Active)).unwrap().len(), 1);
        assert!(log.find_active(&conflict.subject, "b").unwrap().is_some());

        let resolution = Resolution {
            conflict_id: conflict.conflict_id.clone(),
            strategy: ResolutionStrategy::Sequential,
            action: ResolutionAction::Queued,
            winner: Some("a".to_string()),
            losers: vec!["b".to_string()],
            merged_value: None,
            rotation: None,
            resolved_by: "tester".to_string(),
            timestamp: Utc::now(),
        };
        log.mark_resolved(&mut conflict, resolution).unwrap();

        assert!(log.list(Some(ConflictStatus::Active)).unwrap().is_empty());
        let stored = log.get(&conflict.conflict_id).unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
        assert_eq!(log.history().unwrap().len(), 1);
    }
}
