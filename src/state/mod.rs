//! Durable namespaced key/value store.
//!
//! A mutation holds the namespace lease (`ns:<name>`) and an in-process
//! async mutex, appends its journal entry, records the key's vector clock,
//! then swaps the new key map in with an atomic rename. Readers never take
//! the lease; they see either the previous or the new `data.json`.

pub mod journal;
pub mod snapshot;
pub mod transform;

pub use journal::{replay, JournalEntry, JournalOperation, KeyMap};
pub use snapshot::{Snapshot, SnapshotInfo};
pub use transform::Transform;

use crate::bus::{MessageBus, MessageMetadata, Publisher, Topic};
use crate::clock::{ClockOrdering, ClockStore, ClockTable, VectorClock};
use crate::config::LockConfig;
use crate::coordinator::AgentContext;
use crate::error::{CoordinationError, Result};
use crate::lease::{LeaseManager, LeaseRequest};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Summary returned by `inspect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub name: String,
    pub key_count: usize,
    pub keys: Vec<String>,
    pub journal_entries: usize,
    pub last_modified: Option<DateTime<Utc>>,
    pub clock: VectorClock,
    pub snapshots: Vec<SnapshotInfo>,
}

/// Outcome of a write carrying the writer's proposed clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClockedWrite {
    Applied {
        old_value: Option<Value>,
        clock: VectorClock,
    },
    /// The stored clock already covers the proposal; nothing written.
    Stale { stored: VectorClock },
    /// Neither clock covers the other; nothing written.
    Concurrent {
        current: Option<Value>,
        stored: VectorClock,
        proposed_value: Value,
        proposed: VectorClock,
        last_writer: Option<String>,
    },
}

pub fn validate_namespace(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if name.is_empty() || name.starts_with('.') || !valid_chars {
        return Err(CoordinationError::validation(format!(
            "invalid namespace name '{name}'"
        )));
    }
    Ok(())
}

pub struct NamespaceStore {
    storage: Storage,
    leases: Arc<LeaseManager>,
    clocks: ClockStore,
    bus: Option<Arc<MessageBus>>,
    config: LockConfig,
    local: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for NamespaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceStore")
            .field("root", &self.storage.root())
            .finish()
    }
}

/// A namespace held by `NamespaceStore::locked`.
pub struct LockedNamespace<'a> {
    store: &'a NamespaceStore,
    ns: &'a str,
    agent: &'a AgentContext,
}

impl LockedNamespace<'_> {
    pub fn namespace(&self) -> &str {
        self.ns
    }

    pub fn key_clock(&self, key: &str) -> Result<VectorClock> {
        Ok(self.store.clocks.load(self.ns)?.key_clock(key))
    }

    /// Clocked write, as `NamespaceStore::set_with_clock`.
    pub fn set_with_clock(&self, key: &str, value: Value, proposed: VectorClock) -> Result<ClockedWrite> {
        self.store
            .write_clocked(self.ns, key, value, self.agent, proposed)
    }
}

impl NamespaceStore {
    pub fn new(storage: Storage, leases: Arc<LeaseManager>, config: LockConfig) -> Self {
        Self {
            clocks: ClockStore::new(storage.clone()),
            storage,
            leases,
            bus: None,
            config,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Broadcast every committed mutation on the `state` topic.
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn data_path(&self, ns: &str) -> PathBuf {
        self.storage.path(&["state", ns, "data.json"])
    }

    fn journal_path(&self, ns: &str) -> PathBuf {
        self.storage.path(&["state", ns, "journal.jsonl"])
    }

    fn snapshot_path(&self, ns: &str, snapshot_id: &str) -> PathBuf {
        self.storage
            .path(&["state", ns, "snapshots", &format!("{snapshot_id}.json")])
    }

    fn local_lock(&self, ns: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        local
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run `f` with exclusive access to `ns` across tasks and processes.
    async fn exclusive<T>(
        &self,
        ns: &str,
        agent: &AgentContext,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        validate_namespace(ns)?;
        let local = self.local_lock(ns);
        let _local = local.lock().await;

        let holder = format!("{}#{}", agent.agent_id, uuid::Uuid::new_v4().simple());
        let request = LeaseRequest::namespace(
            ns,
            &holder,
            &agent.agent_type,
            self.config.namespace_lease_ttl_seconds,
        );
        let lease = self
            .leases
            .acquire(&request, Duration::from_millis(self.config.acquire_timeout_ms))
            .await?;

        let result = f();

        if let Err(e) = self.leases.release(&lease.key, &lease.holder) {
            warn!(namespace = %ns, error = %e, "failed to release namespace lease");
        }
        result
    }

    /// Whole key map; an absent namespace is empty.
    pub fn load(&self, ns: &str) -> Result<KeyMap> {
        validate_namespace(ns)?;
        Ok(self.storage.read_json(&self.data_path(ns))?.unwrap_or_default())
    }

    pub fn exists(&self, ns: &str) -> bool {
        self.storage.path(&["state", ns]).is_dir()
    }

    /// Value of `key`, or the whole namespace as an object when `key` is None.
    pub fn get(&self, ns: &str, key: Option<&str>) -> Result<Option<Value>> {
        let map = self.load(ns)?;
        Ok(match key {
            Some(key) => map.get(key).cloned(),
            None if self.exists(ns) => Some(journal::map_to_value(&map)),
            None => None,
        })
    }

    /// Journal, record the clock, swap data in. Caller holds the namespace.
    /// A failure after the journal append rolls the journal and clock table
    /// back, so replaying the journal reproduces `data.json`.
    fn commit(
        &self,
        ns: &str,
        map: &KeyMap,
        entry: JournalEntry,
        agent: &AgentContext,
    ) -> Result<()> {
        let journal = self.journal_path(ns);
        let journal_len = self.storage.file_len(&journal)?;
        self.storage.append_jsonl(&journal, &entry)?;

        let applied = self.record_clocks(ns, &entry, agent).and_then(|previous| {
            self.storage
                .write_json_atomic(&self.data_path(ns), map)
                .inspect_err(|_| {
                    if let Err(e) = self.clocks.replace(ns, &previous) {
                        warn!(namespace = %ns, error = %e, "failed to roll back clocks");
                    }
                })
        });
        if let Err(e) = applied {
            if let Err(rollback) = self.storage.truncate(&journal, journal_len) {
                warn!(namespace = %ns, error = %rollback, "failed to roll back journal");
            }
            return Err(e);
        }

        info!(
            namespace = %ns,
            key = ?entry.key,
            operation = %entry.operation,
            agent_id = %agent.agent_id,
            "journal entry committed"
        );
        self.broadcast(&entry, agent);
        Ok(())
    }

    /// Record the clocks of `entry`; returns the table as it was before.
    fn record_clocks(
        &self,
        ns: &str,
        entry: &JournalEntry,
        agent: &AgentContext,
    ) -> Result<ClockTable> {
        match (&entry.operation, &entry.key) {
            (JournalOperation::Restore, _) | (_, None) => {
                let old = entry.old_value.as_ref().and_then(Value::as_object);
                let new = entry.new_value.as_ref().and_then(Value::as_object);
                let keys: BTreeSet<String> = old
                    .into_iter()
                    .chain(new)
                    .flat_map(|m| m.keys().cloned())
                    .collect();
                self.clocks.update(ns, |table| {
                    let previous = table.clone();
                    for key in &keys {
                        let clock = table.key_clock(key).ticked(&agent.agent_id);
                        table.record(key, &agent.agent_id, clock);
                    }
                    if keys.is_empty() {
                        table.namespace.tick(&agent.agent_id);
                    }
                    previous
                })
            }
            (_, Some(key)) => {
                let clock = entry.clock.clone();
                self.clocks.update(ns, |table| {
                    let previous = table.clone();
                    table.record(key, &agent.agent_id, clock);
                    previous
                })
            }
        }
    }

    fn broadcast(&self, entry: &JournalEntry, agent: &AgentContext) {
        let Some(bus) = &self.bus else {
            return;
        };
        let payload = json!({
            "namespace": entry.namespace,
            "key": entry.key,
            "operation": entry.operation,
            "new_value": entry.new_value,
            "clock": entry.clock,
        });
        let metadata = MessageMetadata {
            session_id: agent.session_id.clone(),
            task_id: agent.task_id.clone(),
            parent_task: None,
        };
        if let Err(e) = bus.publish(
            Topic::State,
            payload,
            Publisher::new(&agent.agent_type, &agent.agent_id),
            metadata,
        ) {
            warn!(namespace = %entry.namespace, error = %e, "state change not broadcast");
        }
    }

    fn keyed_entry(
        &self,
        ns: &str,
        operation: JournalOperation,
        key: &str,
        old_value: Option<Value>,
        new_value: Option<Value>,
        agent: &AgentContext,
        clock: VectorClock,
    ) -> JournalEntry {
        JournalEntry {
            timestamp: Utc::now(),
            operation,
            namespace: ns.to_string(),
            key: Some(key.to_string()),
            old_value,
            new_value,
            agent_id: agent.agent_id.clone(),
            clock,
        }
    }

    /// Set `key` and return its previous value.
    pub async fn set(
        &self,
        ns: &str,
        key: &str,
        value: Value,
        agent: &AgentContext,
    ) -> Result<Option<Value>> {
        self.exclusive(ns, agent, || {
            let mut map = self.load(ns)?;
            let clock = self.clocks.load(ns)?.key_clock(key).ticked(&agent.agent_id);
            let old = map.insert(key.to_string(), value.clone());
            let entry = self.keyed_entry(ns, JournalOperation::Set, key, old.clone(), Some(value), agent, clock);
            self.commit(ns, &map, entry, agent)?;
            Ok(old)
        })
        .await
    }

    /// Set `key` only if `proposed` is causally after the stored key clock.
    pub async fn set_with_clock(
        &self,
        ns: &str,
        key: &str,
        value: Value,
        agent: &AgentContext,
        proposed: VectorClock,
    ) -> Result<ClockedWrite> {
        self.exclusive(ns, agent, || {
            self.write_clocked(ns, key, value, agent, proposed)
        })
        .await
    }

    /// Run `f` while holding `ns`, with clocked writes available through
    /// the handle it receives.
    pub async fn locked<T>(
        &self,
        ns: &str,
        agent: &AgentContext,
        f: impl FnOnce(&LockedNamespace<'_>) -> Result<T>,
    ) -> Result<T> {
        self.exclusive(ns, agent, || {
            f(&LockedNamespace {
                store: self,
                ns,
                agent,
            })
        })
        .await
    }

    fn write_clocked(
        &self,
        ns: &str,
        key: &str,
        value: Value,
        agent: &AgentContext,
        proposed: VectorClock,
    ) -> Result<ClockedWrite> {
        let table = self.clocks.load(ns)?;
        let stored = table.key_clock(key);

        match proposed.compare(&stored) {
            ClockOrdering::Before | ClockOrdering::Equal => {
                info!(namespace = %ns, key = %key, agent_id = %agent.agent_id, "stale write dropped");
                Ok(ClockedWrite::Stale { stored })
            }
            ClockOrdering::Concurrent => {
                let current = self.load(ns)?.get(key).cloned();
                Ok(ClockedWrite::Concurrent {
                    current,
                    stored,
                    proposed_value: value,
                    proposed,
                    last_writer: table.last_writer(key).map(str::to_string),
                })
            }
            ClockOrdering::After => {
                let mut clock = proposed.merged(&stored);
                if clock.get(&agent.agent_id) <= stored.get(&agent.agent_id) {
                    clock.tick(&agent.agent_id);
                }
                let mut map = self.load(ns)?;
                let old = map.insert(key.to_string(), value.clone());
                let entry = self.keyed_entry(
                    ns,
                    JournalOperation::Set,
                    key,
                    old.clone(),
                    Some(value),
                    agent,
                    clock.clone(),
                );
                self.commit(ns, &map, entry, agent)?;
                Ok(ClockedWrite::Applied {
                    old_value: old,
                    clock,
                })
            }
        }
    }

    /// Replace `key` with `f(current)` and return the new value.
    pub async fn update<F>(&self, ns: &str, key: &str, f: F, agent: &AgentContext) -> Result<Value>
    where
        F: FnOnce(Option<&Value>) -> Result<Value>,
    {
        self.exclusive(ns, agent, || {
            let mut map = self.load(ns)?;
            let old = map.get(key).cloned();
            let new = f(old.as_ref())?;
            let clock = self.clocks.load(ns)?.key_clock(key).ticked(&agent.agent_id);
            map.insert(key.to_string(), new.clone());
            let entry = self.keyed_entry(ns, JournalOperation::Update, key, old, Some(new.clone()), agent, clock);
            self.commit(ns, &map, entry, agent)?;
            Ok(new)
        })
        .await
    }

    pub async fn update_with(
        &self,
        ns: &str,
        key: &str,
        transform: &Transform,
        agent: &AgentContext,
    ) -> Result<Value> {
        self.update(ns, key, |current| transform.apply(current), agent)
            .await
    }

    /// Remove `key`; deleting an absent key changes nothing.
    pub async fn delete(&self, ns: &str, key: &str, agent: &AgentContext) -> Result<Option<Value>> {
        self.exclusive(ns, agent, || {
            let mut map = self.load(ns)?;
            let Some(old) = map.remove(key) else {
                return Ok(None);
            };
            let clock = self.clocks.load(ns)?.key_clock(key).ticked(&agent.agent_id);
            let entry = self.keyed_entry(ns, JournalOperation::Delete, key, Some(old.clone()), None, agent, clock);
            self.commit(ns, &map, entry, agent)?;
            Ok(Some(old))
        })
        .await
    }

    fn write_snapshot(&self, ns: &str, description: &str, agent: &AgentContext, data: KeyMap) -> Result<Snapshot> {
        let snapshot = Snapshot::new(ns, description, &agent.agent_id, data);
        self.storage
            .write_json_atomic(&self.snapshot_path(ns, &snapshot.snapshot_id), &snapshot)?;
        info!(namespace = %ns, snapshot_id = %snapshot.snapshot_id, "snapshot created");
        Ok(snapshot)
    }

    pub async fn snapshot(&self, ns: &str, description: &str, agent: &AgentContext) -> Result<Snapshot> {
        validate_namespace(ns)?;
        if !self.exists(ns) {
            return Err(CoordinationError::not_found("namespace", ns));
        }
        self.exclusive(ns, agent, || {
            let data = self.load(ns)?;
            self.write_snapshot(ns, description, agent, data)
        })
        .await
    }

    /// Replace the namespace with a snapshot. The current contents are
    /// snapshotted first; that undo snapshot is returned.
    pub async fn restore(&self, ns: &str, snapshot_id: &str, agent: &AgentContext) -> Result<Snapshot> {
        validate_namespace(ns)?;
        let target: Snapshot = self
            .storage
            .read_json(&self.snapshot_path(ns, snapshot_id))?
            .ok_or_else(|| CoordinationError::not_found("snapshot", snapshot_id))?;

        self.exclusive(ns, agent, || {
            let current = self.load(ns)?;
            let undo = self.write_snapshot(
                ns,
                &format!("before restore of {snapshot_id}"),
                agent,
                current.clone(),
            )?;

            let entry = JournalEntry {
                timestamp: Utc::now(),
                operation: JournalOperation::Restore,
                namespace: ns.to_string(),
                key: None,
                old_value: Some(journal::map_to_value(&current)),
                new_value: Some(journal::map_to_value(&target.data)),
                agent_id: agent.agent_id.clone(),
                clock: self.clocks.load(ns)?.namespace.ticked(&agent.agent_id),
            };
            self.commit(ns, &target.data, entry, agent)?;
            info!(namespace = %ns, snapshot_id = %snapshot_id, undo = %undo.snapshot_id, "namespace restored");
            Ok(undo)
        })
        .await
    }

    pub fn snapshots(&self, ns: &str) -> Result<Vec<SnapshotInfo>> {
        validate_namespace(ns)?;
        let dir = self.storage.path(&["state", ns, "snapshots"]);
        let mut infos = Vec::new();
        for path in self.storage.list_files(&dir, "json")? {
            if let Some(snapshot) = self.storage.read_json::<Snapshot>(&path)? {
                infos.push(snapshot.info());
            }
        }
        infos.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(infos)
    }

    /// Journal entries of `ns`, optionally only those touching `key`.
    pub fn journal(&self, ns: &str, key: Option<&str>) -> Result<Vec<JournalEntry>> {
        validate_namespace(ns)?;
        let entries: Vec<JournalEntry> = self.storage.read_jsonl(&self.journal_path(ns))?;
        Ok(match key {
            Some(key) => entries.into_iter().filter(|e| e.touches(key)).collect(),
            None => entries,
        })
    }

    pub fn namespaces(&self) -> Result<Vec<String>> {
        self.storage.list_dirs(&self.storage.path(&["state"]))
    }

    /// Stored namespace clock, or the key clock when `key` is given.
    pub fn clock(&self, ns: &str, key: Option<&str>) -> Result<VectorClock> {
        validate_namespace(ns)?;
        let table = self.clocks.load(ns)?;
        Ok(match key {
            Some(key) => table.key_clock(key),
            None => table.namespace,
        })
    }

    pub fn tick(&self, ns: &str, agent_id: &str) -> Result<VectorClock> {
        validate_namespace(ns)?;
        self.clocks.tick(ns, agent_id)
    }

    pub fn inspect(&self, ns: &str) -> Result<NamespaceInfo> {
        validate_namespace(ns)?;
        if !self.exists(ns) {
            return Err(CoordinationError::not_found("namespace", ns));
        }
        let map = self.load(ns)?;
        let journal = self.journal(ns, None)?;
        Ok(NamespaceInfo {
            name: ns.to_string(),
            key_count: map.len(),
            keys: map.keys().cloned().collect(),
            journal_entries: journal.len(),
            last_modified: journal.last().map(|e| e.timestamp),
            clock: self.clock(ns, None)?,
            snapshots: self.snapshots(ns)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Number;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> NamespaceStore {
        let storage = Storage::new(dir.path());
        let leases = Arc::new(LeaseManager::new(storage.clone(), LockConfig::default()));
        NamespaceStore::new(storage, leases, LockConfig::default())
    }

    fn agent(id: &str) -> AgentContext {
        AgentContext::new(id, "coder")
    }

    #[test]
    fn test_namespace_validation() {
        assert!(validate_namespace("metrics").is_ok());
        assert!(validate_namespace("team-a.v2_x").is_ok());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace(".hidden").is_err());
        assert!(validate_namespace("a/b").is_err());
    }

    #[tokio::test]
    async fn test_set_update_get_and_journal() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = agent("agent-a");

        assert_eq!(store.set("metrics", "counter", json!(5), &a).await.unwrap(), None);
        let new = store
            .update_with("metrics", "counter", &Transform::Increment(Number::from(1)), &a)
            .await
            .unwrap();
        assert_eq!(new, json!(6));
        assert_eq!(store.get("metrics", Some("counter")).unwrap(), Some(json!(6)));
        assert_eq!(store.journal("metrics", Some("counter")).unwrap().len(), 2);
        assert_eq!(store.clock("metrics", Some("counter")).unwrap().get("agent-a"), 2);
    }

    #[tokio::test]
    async fn test_failed_update_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = agent("agent-a");
        store.set("metrics", "name", json!("x"), &a).await.unwrap();

        let err = store
            .update_with("metrics", "name", &Transform::Increment(Number::from(1)), &a)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));
        assert_eq!(store.get("metrics", Some("name")).unwrap(), Some(json!("x")));
        assert_eq!(store.journal("metrics", None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clocked_write_outcomes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = agent("a");
        let b = agent("b");

        store.set("shared", "k", json!(1), &a).await.unwrap();
        let observed = store.clock("shared", Some("k")).unwrap();

        let applied = store
            .set_with_clock("shared", "k", json!(2), &b, observed.ticked("b"))
            .await
            .unwrap();
        assert!(matches!(applied, ClockedWrite::Applied { .. }));

        let stale = store
            .set_with_clock("shared", "k", json!(3), &a, observed.clone())
            .await
            .unwrap();
        assert!(matches!(stale, ClockedWrite::Stale { .. }));

        let concurrent = store
            .set_with_clock("shared", "k", json!(4), &a, observed.ticked("a"))
            .await
            .unwrap();
        match concurrent {
            ClockedWrite::Concurrent { current, last_writer, .. } => {
                assert_eq!(current, Some(json!(2)));
                assert_eq!(last_writer.as_deref(), Some("b"));
            }
            other => panic!("expected concurrent, got {other:?}"),
        }
        assert_eq!(store.get("shared", Some("k")).unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_failed_data_write_rolls_back_journal_and_clocks() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = agent("a");
        store.set("cfg", "mode", json!("fast"), &a).await.unwrap();
        let clocks = store.clocks.load("cfg").unwrap();

        let data = store.data_path("cfg");
        std::fs::remove_file(&data).unwrap();
        std::fs::create_dir(&data).unwrap();
        std::fs::write(data.join("blocker"), b"x").unwrap();

        let mut map = KeyMap::new();
        map.insert("mode".to_string(), json!("slow"));
        let entry = store.keyed_entry(
            "cfg",
            JournalOperation::Set,
            "mode",
            Some(json!("fast")),
            Some(json!("slow")),
            &a,
            clocks.key_clock("mode").ticked("a"),
        );
        assert!(store.commit("cfg", &map, entry, &a).is_err());

        assert_eq!(store.journal("cfg", None).unwrap().len(), 1);
        assert_eq!(store.clocks.load("cfg").unwrap(), clocks);
    }

    #[tokio::test]
    async fn test_restore_takes_undo_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = agent("a");

        store.set("cfg", "mode", json!("fast"), &a).await.unwrap();
        let snap = store.snapshot("cfg", "baseline", &a).await.unwrap();
        store.set("cfg", "mode", json!("slow"), &a).await.unwrap();
        store.set("cfg", "extra", json!(true), &a).await.unwrap();

        let undo = store.restore("cfg", &snap.snapshot_id, &a).await.unwrap();
        assert_eq!(undo.data.len(), 2);
        assert_eq!(store.load("cfg").unwrap(), snap.data);
        assert_eq!(store.snapshots("cfg").unwrap().len(), 2);

        let replayed = replay(&store.journal("cfg", None).unwrap());
        assert_eq!(replayed, store.load("cfg").unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_namespace_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir).snapshot("nothing", "x", &agent("a")).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { .. }));
    }
}
