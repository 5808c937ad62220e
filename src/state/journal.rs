use crate::clock::VectorClock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Key -> value contents of one namespace.
pub type KeyMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalOperation {
    Set,
    Update,
    Delete,
    Restore,
}

impl fmt::Display for JournalOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalOperation::Set => write!(f, "set"),
            JournalOperation::Update => write!(f, "update"),
            JournalOperation::Delete => write!(f, "delete"),
            JournalOperation::Restore => write!(f, "restore"),
        }
    }
}

/// One line of `state/<ns>/journal.jsonl`.
///
/// `restore` entries carry no key; their values are the whole key map before
/// and after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: JournalOperation,
    pub namespace: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
    pub agent_id: String,
    #[serde(default)]
    pub clock: VectorClock,
}

impl JournalEntry {
    pub fn touches(&self, key: &str) -> bool {
        match self.operation {
            JournalOperation::Restore => true,
            _ => self.key.as_deref() == Some(key),
        }
    }
}

/// Apply one entry to `map`.
pub fn apply(map: &mut KeyMap, entry: &JournalEntry) {
    match entry.operation {
        JournalOperation::Set | JournalOperation::Update => {
            if let (Some(key), Some(value)) = (&entry.key, &entry.new_value) {
                map.insert(key.clone(), value.clone());
            }
        }
        JournalOperation::Delete => {
            if let Some(key) = &entry.key {
                map.remove(key);
            }
        }
        JournalOperation::Restore => {
            *map = match &entry.new_value {
                Some(Value::Object(object)) => object
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                _ => KeyMap::new(),
            };
        }
    }
}

/// Rebuild namespace contents from an empty map.
pub fn replay<'a>(entries: impl IntoIterator<Item = &'a JournalEntry>) -> KeyMap {
    let mut map = KeyMap::new();
    for entry in entries {
        apply(&mut map, entry);
    }
    map
}

pub fn map_to_value(map: &KeyMap) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(operation: JournalOperation, key: Option<&str>, new_value: Option<Value>) -> JournalEntry {
        JournalEntry {
            timestamp: Utc::now(),
            operation,
            namespace: "metrics".to_string(),
            key: key.map(str::to_string),
            old_value: None,
            new_value,
            agent_id: "agent-a".to_string(),
            clock: VectorClock::new(),
        }
    }

    #[test]
    fn test_replay_set_update_delete() {
        let entries = vec![
            entry(JournalOperation::Set, Some("counter"), Some(json!(5))),
            entry(JournalOperation::Update, Some("counter"), Some(json!(6))),
            entry(JournalOperation::Set, Some("tmp"), Some(json!("x"))),
            entry(JournalOperation::Delete, Some("tmp"), None),
        ];
        let map = replay(&entries);
        assert_eq!(map.len(), 1);
        assert_eq!(map["counter"], json!(6));
    }

    #[test]
    fn test_restore_replaces_whole_map() {
        let entries = vec![
            entry(JournalOperation::Set, Some("a"), Some(json!(1))),
            entry(JournalOperation::Restore, None, Some(json!({"b": 2}))),
        ];
        let map = replay(&entries);
        assert_eq!(map_to_value(&map), json!({"b": 2}));
        assert!(entries[1].touches("a"));
        assert!(!entries[0].touches("b"));
    }
}
