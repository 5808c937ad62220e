//! Timed mutual exclusion over logical resource keys.
//!
//! Each key has one lease record under `leases/` holding every current
//! holder: any number of `read` holders, or a single exclusive
//! (`modify`/`delete`) holder. Lease ids come from a persisted monotonic
//! sequence; holders keep a lease alive by renewing it with a compare-and-swap
//! on its id. A lease whose TTL has elapsed and whose holder the liveness
//! probe reports dead is reclaimed by the next acquirer.

use crate::config::LockConfig;
use crate::error::{CoordinationError, Result};
use crate::storage::{file_key, Storage};
use chrono::{DateTime, Utc};
#[cfg(any(test, feature = "testing"))]
use mockall::automock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOperation {
    Read,
    Modify,
    Delete,
}

impl LeaseOperation {
    pub fn is_exclusive(self) -> bool {
        !matches!(self, LeaseOperation::Read)
    }

    /// Only read/read is compatible.
    pub fn compatible(self, other: LeaseOperation) -> bool {
        !self.is_exclusive() && !other.is_exclusive()
    }

    /// The stronger of two operations, used when a holder re-claims.
    pub fn strongest(self, other: LeaseOperation) -> LeaseOperation {
        use LeaseOperation::*;
        match (self, other) {
            (Delete, _) | (_, Delete) => Delete,
            (Modify, _) | (_, Modify) => Modify,
            _ => Read,
        }
    }
}

impl fmt::Display for LeaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseOperation::Read => write!(f, "read"),
            LeaseOperation::Modify => write!(f, "modify"),
            LeaseOperation::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for LeaseOperation {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "read" => Ok(LeaseOperation::Read),
            "modify" | "write" => Ok(LeaseOperation::Modify),
            "delete" => Ok(LeaseOperation::Delete),
            other => Err(CoordinationError::validation(format!(
                "unknown operation '{other}' (expected read, modify or delete)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: u64,
    pub key: String,
    pub resource_type: String,
    pub resource_path: String,
    pub holder: String,
    pub holder_type: String,
    pub operation: LeaseOperation,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub host: String,
    /// Holder whose stale lease was reclaimed to grant this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaimed_from: Option<String>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl_ms = i64::try_from(self.ttl_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        (now - self.renewed_at).num_milliseconds() >= ttl_ms
    }

    /// Milliseconds left before expiry, 0 when already expired.
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        let ttl_ms = i64::try_from(self.ttl_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        let left = ttl_ms.saturating_sub((now - self.renewed_at).num_milliseconds());
        u64::try_from(left).unwrap_or(0)
    }
}

/// All holders of one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub key: String,
    pub holders: Vec<Lease>,
}

impl LeaseRecord {
    pub fn holder(&self, agent_id: &str) -> Option<&Lease> {
        self.holders.iter().find(|l| l.holder == agent_id)
    }
}

/// Decides whether the holder of an expired lease may still be alive.
#[cfg_attr(any(test, feature = "testing"), automock)]
pub trait HolderLiveness: Send + Sync {
    fn is_alive(&self, lease: &Lease, now: DateTime<Utc>) -> bool;
}

/// Default probe: a holder is alive iff it renewed within its TTL.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenewalLiveness;

impl HolderLiveness for RenewalLiveness {
    fn is_alive(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        !lease.is_expired(now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub key: String,
    pub resource_type: String,
    pub resource_path: String,
    pub holder: String,
    pub holder_type: String,
    pub operation: LeaseOperation,
    pub ttl_seconds: u64,
}

impl LeaseRequest {
    /// Request for the lease on `resource:<type>:<path>`.
    pub fn resource(
        resource_type: &str,
        resource_path: &str,
        holder: &str,
        holder_type: &str,
        operation: LeaseOperation,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            key: resource_key(resource_type, resource_path),
            resource_type: resource_type.to_string(),
            resource_path: resource_path.to_string(),
            holder: holder.to_string(),
            holder_type: holder_type.to_string(),
            operation,
            ttl_seconds,
        }
    }

    /// Exclusive request for the lease guarding a namespace.
    pub fn namespace(namespace: &str, holder: &str, holder_type: &str, ttl_seconds: u64) -> Self {
        Self {
            key: format!("ns:{namespace}"),
            resource_type: "namespace".to_string(),
            resource_path: namespace.to_string(),
            holder: holder.to_string(),
            holder_type: holder_type.to_string(),
            operation: LeaseOperation::Modify,
            ttl_seconds,
        }
    }
}

pub fn resource_key(resource_type: &str, resource_path: &str) -> String {
    format!("resource:{resource_type}:{resource_path}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireAttempt {
    Granted(Lease),
    /// Key is held by other agents whose operations are incompatible.
    Held { holders: Vec<Lease> },
}

pub struct LeaseManager {
    storage: Storage,
    config: LockConfig,
    liveness: Arc<dyn HolderLiveness>,
    host: String,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("root", &self.storage.root())
            .field("host", &self.host)
            .finish()
    }
}

impl LeaseManager {
    pub fn new(storage: Storage, config: LockConfig) -> Self {
        Self::with_liveness(storage, config, Arc::new(RenewalLiveness))
    }

    pub fn with_liveness(
        storage: Storage,
        config: LockConfig,
        liveness: Arc<dyn HolderLiveness>,
    ) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            storage,
            config,
            liveness,
            host,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn record_path(&self, key: &str) -> std::path::PathBuf {
        self.storage
            .path(&["leases", &format!("{}.json", file_key(key))])
    }

    fn guard_name(key: &str) -> String {
        format!("lease:{key}")
    }

    fn load(&self, key: &str) -> Result<LeaseRecord> {
        Ok(self
            .storage
            .read_json(&self.record_path(key))?
            .unwrap_or_else(|| LeaseRecord {
                key: key.to_string(),
                holders: Vec::new(),
            }))
    }

    fn store(&self, record: &LeaseRecord) -> Result<()> {
        let path = self.record_path(&record.key);
        if record.holders.is_empty() {
            self.storage.remove(&path)?;
            Ok(())
        } else {
            self.storage.write_json_atomic(&path, record)
        }
    }

    /// Next id from the persisted monotonic sequence.
    fn next_lease_id(&self) -> Result<u64> {
        self.storage.with_guard("lease-sequence", || {
            let path = self.storage.path(&["leases", "sequence"]);
            let current: u64 = self.storage.read_json(&path)?.unwrap_or(0);
            let next = current + 1;
            self.storage.write_json_atomic(&path, &next)?;
            Ok(next)
        })
    }

    /// Drop holders that are expired and reported dead; returns them.
    fn prune_stale(&self, record: &mut LeaseRecord, now: DateTime<Utc>) -> Vec<Lease> {
        let (stale, live): (Vec<Lease>, Vec<Lease>) = std::mem::take(&mut record.holders)
            .into_iter()
            .partition(|l| l.is_expired(now) && !self.liveness.is_alive(l, now));
        record.holders = live;
        stale
    }

    fn new_lease(&self, request: &LeaseRequest, now: DateTime<Utc>) -> Result<Lease> {
        Ok(Lease {
            lease_id: self.next_lease_id()?,
            key: request.key.clone(),
            resource_type: request.resource_type.clone(),
            resource_path: request.resource_path.clone(),
            holder: request.holder.clone(),
            holder_type: request.holder_type.clone(),
            operation: request.operation,
            acquired_at: now,
            renewed_at: now,
            ttl_seconds: request.ttl_seconds,
            host: self.host.clone(),
            reclaimed_from: None,
        })
    }

    /// One non-blocking acquisition attempt.
    pub fn try_acquire(&self, request: &LeaseRequest) -> Result<AcquireAttempt> {
        self.storage.with_guard(&Self::guard_name(&request.key), || {
            let now = Utc::now();
            let mut record = self.load(&request.key)?;

            let stale = self.prune_stale(&mut record, now);
            for lease in &stale {
                info!(
                    key = %lease.key,
                    lease_id = lease.lease_id,
                    previous_holder = %lease.holder,
                    new_holder = %request.holder,
                    "StaleLeaseReclaimed"
                );
            }

            let conflicting: Vec<Lease> = record
                .holders
                .iter()
                .filter(|l| l.holder != request.holder && !l.operation.compatible(request.operation))
                .cloned()
                .collect();
            if !conflicting.is_empty() {
                if !stale.is_empty() {
                    self.store(&record)?;
                }
                debug!(key = %request.key, holder = %request.holder, "lease held by others");
                return Ok(AcquireAttempt::Held {
                    holders: conflicting,
                });
            }

            let reclaimed_from = stale
                .iter()
                .find(|l| l.holder != request.holder)
                .map(|l| l.holder.clone());

            let lease = match record.holders.iter_mut().find(|l| l.holder == request.holder) {
                Some(existing) => {
                    existing.operation = existing.operation.strongest(request.operation);
                    existing.renewed_at = now;
                    existing.ttl_seconds = request.ttl_seconds;
                    existing.clone()
                }
                None => {
                    let mut lease = self.new_lease(request, now)?;
                    lease.reclaimed_from = reclaimed_from;
                    record.holders.push(lease.clone());
                    lease
                }
            };
            self.store(&record)?;

            info!(
                key = %lease.key,
                lease_id = lease.lease_id,
                holder = %lease.holder,
                operation = %lease.operation,
                "lease acquired"
            );
            Ok(AcquireAttempt::Granted(lease))
        })
    }

    /// Retry `try_acquire` with bounded, jittered backoff until `timeout`.
    pub async fn acquire(&self, request: &LeaseRequest, timeout: Duration) -> Result<Lease> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if let AcquireAttempt::Granted(lease) = self.try_acquire(request)? {
                return Ok(lease);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(CoordinationError::LockTimeout {
                    key: request.key.clone(),
                    waited_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }

            let delay = self.backoff_delay(attempt).min(timeout - elapsed);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .backoff_min_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.backoff_max_ms);
        let jitter = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }

    /// Release `holder`'s lease on `key`. Returns false (and changes nothing)
    /// when `holder` does not hold it.
    pub fn release(&self, key: &str, holder: &str) -> Result<bool> {
        self.storage.with_guard(&Self::guard_name(key), || {
            let mut record = self.load(key)?;
            let before = record.holders.len();
            record.holders.retain(|l| l.holder != holder);
            if record.holders.len() == before {
                debug!(key = %key, holder = %holder, "release ignored: not a holder");
                return Ok(false);
            }
            self.store(&record)?;
            info!(key = %key, holder = %holder, "lease released");
            Ok(true)
        })
    }

    /// Refresh `renewed_at` if `lease_id` still identifies a current holder.
    pub fn renew(&self, key: &str, lease_id: u64) -> Result<Lease> {
        self.storage.with_guard(&Self::guard_name(key), || {
            let mut record = self.load(key)?;
            let lease = record
                .holders
                .iter_mut()
                .find(|l| l.lease_id == lease_id)
                .ok_or_else(|| CoordinationError::not_found("lease", format!("{key}#{lease_id}")))?;
            lease.renewed_at = Utc::now();
            let renewed = lease.clone();
            self.store(&record)?;
            debug!(key = %key, lease_id, "lease renewed");
            Ok(renewed)
        })
    }

    pub fn inspect(&self, key: &str) -> Result<Option<LeaseRecord>> {
        self.storage.read_json(&self.record_path(key))
    }

    pub fn list(&self) -> Result<Vec<LeaseRecord>> {
        let dir = self.storage.path(&["leases"]);
        let mut records = Vec::new();
        for path in self.storage.list_files(&dir, "json")? {
            if let Some(record) = self.storage.read_json::<LeaseRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    /// Remove every expired lease whose holder is not alive.
    pub fn cleanup(&self) -> Result<Vec<Lease>> {
        let mut removed = Vec::new();
        for record in self.list()? {
            let key = record.key.clone();
            let stale = self.storage.with_guard(&Self::guard_name(&key), || {
                let mut record = self.load(&key)?;
                let stale = self.prune_stale(&mut record, Utc::now());
                if !stale.is_empty() {
                    self.store(&record)?;
                }
                Ok(stale)
            })?;
            for lease in &stale {
                info!(key = %lease.key, holder = %lease.holder, "expired lease removed");
            }
            removed.extend(stale);
        }
        Ok(removed)
    }

    /// Evict `evict` from `request.key` and grant `request` unconditionally.
    /// Only used to apply a recorded conflict resolution.
    pub(crate) fn transfer(&self, request: &LeaseRequest, evict: &[String]) -> Result<Lease> {
        self.storage.with_guard(&Self::guard_name(&request.key), || {
            let now = Utc::now();
            let mut record = self.load(&request.key)?;
            record.holders.retain(|l| !evict.contains(&l.holder));

            let lease = match record.holders.iter_mut().find(|l| l.holder == request.holder) {
                Some(existing) => {
                    existing.operation = existing.operation.strongest(request.operation);
                    existing.renewed_at = now;
                    existing.ttl_seconds = request.ttl_seconds;
                    existing.clone()
                }
                None => {
                    let lease = self.new_lease(request, now)?;
                    record.holders.push(lease.clone());
                    lease
                }
            };
            self.store(&record)?;
            info!(key = %request.key, holder = %request.holder, evicted = ?evict, "lease transferred");
            Ok(lease)
        })
    }
}
