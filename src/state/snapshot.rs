use super::journal::KeyMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable copy of a namespace at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub namespace: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub created_by: String,
    pub data: KeyMap,
}

impl Snapshot {
    pub fn new(namespace: &str, description: &str, created_by: &str, data: KeyMap) -> Self {
        let timestamp = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            // Timestamp prefix keeps file listings in creation order.
            snapshot_id: format!("{}-{}", timestamp.format("%Y%m%dT%H%M%S%3f"), &suffix[..8]),
            namespace: namespace.to_string(),
            timestamp,
            description: description.to_string(),
            created_by: created_by.to_string(),
            data,
        }
    }

    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            snapshot_id: self.snapshot_id.clone(),
            timestamp: self.timestamp,
            description: self.description.clone(),
            created_by: self.created_by.clone(),
            key_count: self.data.len(),
        }
    }
}

/// Snapshot metadata without the data, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub created_by: String,
    pub key_count: usize,
}
