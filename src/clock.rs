//! Vector clocks for causality tracking between agents.
//!
//! One clock is kept per namespace and one per (namespace, key). Every state
//! mutation ticks the acting agent's counter; comparing a proposed clock with
//! the stored one decides whether a write is newer, stale, or concurrent.

use crate::error::Result;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Causal relation of one clock to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

impl fmt::Display for ClockOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClockOrdering::Equal => "equal",
            ClockOrdering::Before => "before",
            ClockOrdering::After => "after",
            ClockOrdering::Concurrent => "concurrent",
        };
        write!(f, "{label}")
    }
}

/// Mapping agent id -> monotonically increasing counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Counter for `agent`; absent agents count as 0.
    pub fn get(&self, agent: &str) -> u64 {
        self.0.get(agent).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.0.iter()
    }

    /// Increment `agent`'s counter and return the new value.
    pub fn tick(&mut self, agent: &str) -> u64 {
        let counter = self.0.entry(agent.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn ticked(&self, agent: &str) -> Self {
        let mut next = self.clone();
        next.tick(agent);
        next
    }

    /// Element-wise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (agent, counter) in &other.0 {
            let entry = self.0.entry(agent.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
    }

    pub fn merged(&self, other: &VectorClock) -> Self {
        let mut next = self.clone();
        next.merge(other);
        next
    }

    /// Compare element-wise over the union of agents.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut any_less = false;
        let mut any_greater = false;

        for agent in self.0.keys().chain(other.0.keys()) {
            let mine = self.get(agent);
            let theirs = other.get(agent);
            if mine < theirs {
                any_less = true;
            } else if mine > theirs {
                any_greater = true;
            }
        }

        match (any_less, any_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }
}

/// Persisted clocks for one namespace, plus the last writer of each key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockTable {
    #[serde(default)]
    pub namespace: VectorClock,
    #[serde(default)]
    pub keys: BTreeMap<String, VectorClock>,
    #[serde(default)]
    pub writers: BTreeMap<String, String>,
}

impl ClockTable {
    pub fn key_clock(&self, key: &str) -> VectorClock {
        self.keys.get(key).cloned().unwrap_or_default()
    }

    pub fn last_writer(&self, key: &str) -> Option<&str> {
        self.writers.get(key).map(String::as_str)
    }

    /// Store `clock` for `key` and advance the namespace clock for `agent`.
    pub fn record(&mut self, key: &str, agent: &str, clock: VectorClock) {
        self.namespace.merge(&clock);
        self.namespace.tick(agent);
        self.keys.insert(key.to_string(), clock);
        self.writers.insert(key.to_string(), agent.to_string());
    }
}

/// Reads and writes `state/<ns>/clocks.json`.
#[derive(Debug, Clone)]
pub struct ClockStore {
    storage: Storage,
}

impl ClockStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn guard_name(namespace: &str) -> String {
        format!("clocks:{namespace}")
    }

    pub fn load(&self, namespace: &str) -> Result<ClockTable> {
        let path = self.storage.path(&["state", namespace, "clocks.json"]);
        Ok(self.storage.read_json(&path)?.unwrap_or_default())
    }

    /// Read-modify-write the clock table under its guard.
    pub fn update<T>(&self, namespace: &str, f: impl FnOnce(&mut ClockTable) -> T) -> Result<T> {
        self.storage.with_guard(&Self::guard_name(namespace), || {
            let path = self.storage.path(&["state", namespace, "clocks.json"]);
            let mut table: ClockTable = self.storage.read_json(&path)?.unwrap_or_default();
            let out = f(&mut table);
            self.storage.write_json_atomic(&path, &table)?;
            Ok(out)
        })
    }

    /// Overwrite the clock table, used to roll back a failed commit.
    pub fn replace(&self, namespace: &str, table: &ClockTable) -> Result<()> {
        self.storage.with_guard(&Self::guard_name(namespace), || {
            let path = self.storage.path(&["state", namespace, "clocks.json"]);
            self.storage.write_json_atomic(&path, table)
        })
    }

    /// Increment `agent`'s counter in the namespace clock.
    pub fn tick(&self, namespace: &str, agent: &str) -> Result<VectorClock> {
        self.update(namespace, |table| {
            table.namespace.tick(agent);
            table.namespace.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|(k, v)| (*k, *v)))
    }

    #[test]
    fn test_compare_reference_cases() {
        assert_eq!(clock(&[("x", 1)]).compare(&clock(&[("x", 1)])), ClockOrdering::Equal);
        assert_eq!(clock(&[("x", 2)]).compare(&clock(&[("x", 1)])), ClockOrdering::After);
        assert_eq!(
            clock(&[("x", 1), ("y", 1)]).compare(&clock(&[("x", 1)])),
            ClockOrdering::After
        );
        assert_eq!(
            clock(&[("x", 1), ("y", 0)]).compare(&clock(&[("x", 0), ("y", 1)])),
            ClockOrdering::Concurrent
        );
        assert_eq!(clock(&[("x", 1)]).compare(&clock(&[("x", 3)])), ClockOrdering::Before);
    }

    #[test]
    fn test_absent_agent_counts_as_zero() {
        assert_eq!(clock(&[("x", 0)]).compare(&VectorClock::new()), ClockOrdering::Equal);
    }

    #[test]
    fn test_tick_and_merge() {
        let mut a = clock(&[("x", 2)]);
        assert_eq!(a.tick("y"), 1);
        let merged = a.merged(&clock(&[("x", 5), ("z", 1)]));
        assert_eq!(merged.get("x"), 5);
        assert_eq!(merged.get("y"), 1);
        assert_eq!(merged.get("z"), 1);
        assert_eq!(merged.compare(&a), ClockOrdering::After);
    }

    #[test]
    fn test_clock_table_record_tracks_writer() {
        let mut table = ClockTable::default();
        table.record("counter", "agent-a", clock(&[("agent-a", 1)]));
        assert_eq!(table.last_writer("counter"), Some("agent-a"));
        assert_eq!(table.key_clock("counter").get("agent-a"), 1);
        assert_eq!(table.namespace.get("agent-a"), 2);
    }

    #[test]
    fn test_clock_serializes_as_plain_map() {
        let json = serde_json::to_string(&clock(&[("x", 1)])).unwrap();
        assert_eq!(json, r#"{"x":1}"#);
    }
}
