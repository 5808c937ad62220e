//! Topic-based publish/subscribe over the shared coordination tree.
//!
//! Every message is stored once under `bus/messages/`; delivery appends a
//! queue entry to the queue file of each matching subscriber, so
//! per-subscriber order is publish order and delivery is at-least-once. A
//! subscriber consumes from the head of its own queue. Waiters in this
//! process are woken through a per-subscriber `Notify`; writes from other
//! processes are picked up by a bounded poll.

use crate::config::BusConfig;
use crate::error::{CoordinationError, Result};
use crate::storage::{file_key, Storage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    System,
    Task,
    State,
    Conflict,
    Coordination,
    /// Wildcard, valid in subscriptions only.
    All,
}

impl Topic {
    pub const PUBLISHABLE: [Topic; 5] = [
        Topic::System,
        Topic::Task,
        Topic::State,
        Topic::Conflict,
        Topic::Coordination,
    ];
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::System => "system",
            Topic::Task => "task",
            Topic::State => "state",
            Topic::Conflict => "conflict",
            Topic::Coordination => "coordination",
            Topic::All => "all",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Topic {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "system" => Ok(Topic::System),
            "task" => Ok(Topic::Task),
            "state" => Ok(Topic::State),
            "conflict" => Ok(Topic::Conflict),
            "coordination" => Ok(Topic::Coordination),
            "all" => Ok(Topic::All),
            other => Err(CoordinationError::validation(format!("unknown topic '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    #[serde(rename = "type")]
    pub publisher_type: String,
    pub id: String,
}

impl Publisher {
    pub fn new(publisher_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            publisher_type: publisher_type.into(),
            id: id.into(),
        }
    }

    pub fn system() -> Self {
        Self::new("system", "concord")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub parent_task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub topic: Topic,
    pub publisher: Publisher,
    pub payload: Value,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

/// Typed message filter; empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Topic>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publisher_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publisher_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SubscriptionFilter {
    pub fn matches(&self, message: &Message) -> bool {
        (self.topics.is_empty()
            || self
                .topics
                .iter()
                .any(|t| *t == Topic::All || *t == message.topic))
            && (self.publisher_types.is_empty()
                || self.publisher_types.contains(&message.publisher.publisher_type))
            && (self.publisher_ids.is_empty() || self.publisher_ids.contains(&message.publisher.id))
            && self
                .task_id
                .as_ref()
                .map_or(true, |id| message.metadata.task_id.as_ref() == Some(id))
            && self
                .session_id
                .as_ref()
                .map_or(true, |id| message.metadata.session_id.as_ref() == Some(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub agent_id: String,
    pub topics: BTreeSet<Topic>,
    #[serde(default)]
    pub filter: Option<SubscriptionFilter>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn wants(&self, message: &Message) -> bool {
        let topic_match = self.topics.contains(&Topic::All) || self.topics.contains(&message.topic);
        topic_match && self.filter.as_ref().map_or(true, |f| f.matches(message))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub message_id: String,
    pub topic: Topic,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub queue_entries_removed: usize,
    pub messages_removed: usize,
}

#[derive(Debug)]
pub struct MessageBus {
    storage: Storage,
    config: BusConfig,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MessageBus {
    pub fn new(storage: Storage, config: BusConfig) -> Self {
        Self {
            storage,
            config,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn message_path(&self, message_id: &str) -> PathBuf {
        self.storage
            .path(&["bus", "messages", &format!("{message_id}.json")])
    }

    fn subscription_path(&self, agent_id: &str) -> PathBuf {
        self.storage
            .path(&["bus", "subscriptions", &format!("{}.json", file_key(agent_id))])
    }

    fn queue_path(&self, agent_id: &str) -> PathBuf {
        self.storage
            .path(&["bus", "queues", &format!("{}.jsonl", file_key(agent_id))])
    }

    fn inbox_guard(agent_id: &str) -> String {
        format!("inbox:{agent_id}")
    }

    fn notifier(&self, agent_id: &str) -> Arc<Notify> {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Store a message and enqueue it for every matching subscriber.
    pub fn publish(
        &self,
        topic: Topic,
        payload: Value,
        publisher: Publisher,
        metadata: MessageMetadata,
    ) -> Result<String> {
        if topic == Topic::All {
            return Err(CoordinationError::validation(
                "'all' is a subscription wildcard and cannot be published to",
            ));
        }

        let timestamp = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let message = Message {
            message_id: format!("{}-{}", timestamp.format("%Y%m%dT%H%M%S%6f"), &suffix[..12]),
            timestamp,
            topic,
            publisher,
            payload,
            metadata,
        };
        self.storage
            .write_json_atomic(&self.message_path(&message.message_id), &message)?;

        let mut delivered = 0usize;
        for subscription in self.subscriptions()? {
            if !subscription.wants(&message) {
                continue;
            }
            let entry = QueueEntry {
                message_id: message.message_id.clone(),
                topic,
                enqueued_at: Utc::now(),
                processed: false,
                processed_at: None,
            };
            let queue = self.queue_path(&subscription.agent_id);
            self.storage
                .with_guard(&Self::inbox_guard(&subscription.agent_id), || {
                    self.storage.append_jsonl(&queue, &entry)
                })?;
            self.notifier(&subscription.agent_id).notify_waiters();
            delivered += 1;
        }

        info!(
            message_id = %message.message_id,
            topic = %topic,
            publisher = %message.publisher.id,
            delivered,
            "message published"
        );
        Ok(message.message_id)
    }

    /// Create or replace `agent_id`'s subscription.
    pub fn subscribe(
        &self,
        agent_id: &str,
        topics: BTreeSet<Topic>,
        filter: Option<SubscriptionFilter>,
    ) -> Result<Subscription> {
        if topics.is_empty() {
            return Err(CoordinationError::validation("a subscription needs at least one topic"));
        }
        let path = self.subscription_path(agent_id);
        self.storage.with_guard(&format!("subscription:{agent_id}"), || {
            let now = Utc::now();
            let created_at = self
                .storage
                .read_json::<Subscription>(&path)?
                .map(|s| s.created_at)
                .unwrap_or(now);
            let subscription = Subscription {
                agent_id: agent_id.to_string(),
                topics,
                filter,
                created_at,
                updated_at: now,
            };
            self.storage.write_json_atomic(&path, &subscription)?;
            info!(agent_id = %agent_id, topics = ?subscription.topics, "subscribed");
            Ok(subscription)
        })
    }

    pub fn update_subscription(
        &self,
        agent_id: &str,
        topics: Option<BTreeSet<Topic>>,
        filter: Option<SubscriptionFilter>,
    ) -> Result<Subscription> {
        let path = self.subscription_path(agent_id);
        self.storage.with_guard(&format!("subscription:{agent_id}"), || {
            let mut subscription = self
                .storage
                .read_json::<Subscription>(&path)?
                .ok_or_else(|| CoordinationError::not_found("subscription", agent_id))?;
            if let Some(topics) = topics {
                if topics.is_empty() {
                    return Err(CoordinationError::validation(
                        "a subscription needs at least one topic",
                    ));
                }
                subscription.topics = topics;
            }
            if let Some(filter) = filter {
                subscription.filter = Some(filter);
            }
            subscription.updated_at = Utc::now();
            self.storage.write_json_atomic(&path, &subscription)?;
            Ok(subscription)
        })
    }

    /// Delete the subscription and its queue. Returns whether it existed.
    pub fn unsubscribe(&self, agent_id: &str) -> Result<bool> {
        let existed = self.storage.remove(&self.subscription_path(agent_id))?;
        let queue = self.queue_path(agent_id);
        self.storage
            .with_guard(&Self::inbox_guard(agent_id), || self.storage.remove(&queue))?;
        if existed {
            info!(agent_id = %agent_id, "unsubscribed");
        }
        Ok(existed)
    }

    pub fn subscription(&self, agent_id: &str) -> Result<Option<Subscription>> {
        self.storage.read_json(&self.subscription_path(agent_id))
    }

    pub fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let dir = self.storage.path(&["bus", "subscriptions"]);
        let mut subscriptions = Vec::new();
        for path in self.storage.list_files(&dir, "json")? {
            if let Some(subscription) = self.storage.read_json(&path)? {
                subscriptions.push(subscription);
            }
        }
        Ok(subscriptions)
    }

    fn require_subscription(&self, agent_id: &str) -> Result<()> {
        if self.subscription(agent_id)?.is_none() {
            return Err(CoordinationError::not_found("subscription", agent_id));
        }
        Ok(())
    }

    fn load_message(&self, message_id: &str) -> Result<Option<Message>> {
        self.storage.read_json(&self.message_path(message_id))
    }

    /// Consume up to `count` unprocessed messages from the head of the queue.
    pub fn read(&self, agent_id: &str, count: usize, topic: Option<Topic>) -> Result<Vec<Message>> {
        self.require_subscription(agent_id)?;
        let queue = self.queue_path(agent_id);

        self.storage.with_guard(&Self::inbox_guard(agent_id), || {
            let mut entries: Vec<QueueEntry> = self.storage.read_jsonl(&queue)?;
            let now = Utc::now();
            let mut messages = Vec::new();
            let mut changed = false;

            for entry in entries.iter_mut().filter(|e| !e.processed) {
                if messages.len() >= count {
                    break;
                }
                if topic.is_some_and(|t| t != Topic::All && t != entry.topic) {
                    continue;
                }
                entry.processed = true;
                entry.processed_at = Some(now);
                changed = true;
                match self.load_message(&entry.message_id)? {
                    Some(message) => messages.push(message),
                    None => warn!(message_id = %entry.message_id, "queued message no longer stored"),
                }
            }

            if changed {
                self.storage.rewrite_jsonl(&queue, &entries)?;
            }
            debug!(agent_id = %agent_id, read = messages.len(), "queue read");
            Ok(messages)
        })
    }

    /// Block until one matching message can be consumed or `timeout` elapses.
    pub async fn wait(
        &self,
        agent_id: &str,
        timeout: Duration,
        topic: Option<Topic>,
    ) -> Result<Message> {
        let notify = self.notifier(agent_id);
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.wait_poll_interval_ms);

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.read(agent_id, 1, topic)?.into_iter().next() {
                return Ok(message);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(CoordinationError::Timeout {
                    what: format!("message for {agent_id}"),
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            let _ = tokio::time::timeout((deadline - now).min(poll), notified).await;
        }
    }

    /// Pending messages matching `filter`, without consuming them.
    pub fn filter(&self, agent_id: &str, filter: &SubscriptionFilter) -> Result<Vec<Message>> {
        self.require_subscription(agent_id)?;
        let entries: Vec<QueueEntry> = self.storage.read_jsonl(&self.queue_path(agent_id))?;
        let mut messages = Vec::new();
        for entry in entries.iter().filter(|e| !e.processed) {
            if let Some(message) = self.load_message(&entry.message_id)? {
                if filter.matches(&message) {
                    messages.push(message);
                }
            }
        }
        Ok(messages)
    }

    pub fn pending(&self, agent_id: &str) -> Result<usize> {
        let entries: Vec<QueueEntry> = self.storage.read_jsonl(&self.queue_path(agent_id))?;
        Ok(entries.iter().filter(|e| !e.processed).count())
    }

    /// Drop processed queue entries and unreferenced messages older than
    /// `retention`.
    pub fn prune(&self, retention: Duration) -> Result<PruneReport> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| CoordinationError::validation(e.to_string()))?;
        let mut report = PruneReport::default();
        let mut referenced = HashSet::new();

        for subscription in self.subscriptions()? {
            let agent_id = subscription.agent_id;
            let queue = self.queue_path(&agent_id);
            self.storage.with_guard(&Self::inbox_guard(&agent_id), || {
                let entries: Vec<QueueEntry> = self.storage.read_jsonl(&queue)?;
                let before = entries.len();
                let kept: Vec<QueueEntry> = entries
                    .into_iter()
                    .filter(|e| !e.processed || e.processed_at.is_some_and(|at| at >= cutoff))
                    .collect();
                if kept.len() != before {
                    self.storage.rewrite_jsonl(&queue, &kept)?;
                    report.queue_entries_removed += before - kept.len();
                }
                referenced.extend(kept.into_iter().map(|e| e.message_id));
                Ok(())
            })?;
        }

        let dir = self.storage.path(&["bus", "messages"]);
        for path in self.storage.list_files(&dir, "json")? {
            let Some(message) = self.storage.read_json::<Message>(&path)? else {
                continue;
            };
            if message.timestamp < cutoff && !referenced.contains(&message.message_id) {
                self.storage.remove(&path)?;
                report.messages_removed += 1;
            }
        }

        info!(
            queue_entries_removed = report.queue_entries_removed,
            messages_removed = report.messages_removed,
            "bus pruned"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn bus(dir: &TempDir) -> MessageBus {
        MessageBus::new(Storage::new(dir.path()), BusConfig::default())
    }

    fn topics(items: &[Topic]) -> BTreeSet<Topic> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_topic_parsing() {
        assert_eq!("STATE".parse::<Topic>().unwrap(), Topic::State);
        assert!("gossip".parse::<Topic>().is_err());
    }

    #[test]
    fn test_publish_to_all_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = bus(&dir)
            .publish(Topic::All, json!({}), Publisher::system(), MessageMetadata::default())
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));
    }

    #[test]
    fn test_read_consumes_in_publish_order() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        bus.subscribe("a", topics(&[Topic::Task]), None).unwrap();

        for n in 0..3 {
            bus.publish(Topic::Task, json!({"n": n}), Publisher::system(), MessageMetadata::default())
                .unwrap();
        }

        let first = bus.read("a", 2, None).unwrap();
        assert_eq!(first.iter().map(|m| m.payload["n"].clone()).collect::<Vec<_>>(), vec![json!(0), json!(1)]);
        assert_eq!(bus.pending("a").unwrap(), 1);
        let rest = bus.read("a", 10, None).unwrap();
        assert_eq!(rest[0].payload["n"], json!(2));
        assert!(bus.read("a", 10, None).unwrap().is_empty());
    }

    #[test]
    fn test_subscription_filter_on_publisher() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        let filter = SubscriptionFilter {
            publisher_types: vec!["orchestrator".to_string()],
            ..Default::default()
        };
        bus.subscribe("a", topics(&[Topic::All]), Some(filter)).unwrap();

        bus.publish(Topic::Task, json!(1), Publisher::new("coder", "c1"), MessageMetadata::default())
            .unwrap();
        bus.publish(Topic::Task, json!(2), Publisher::new("orchestrator", "o1"), MessageMetadata::default())
            .unwrap();

        let messages = bus.read("a", 10, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].publisher.id, "o1");
    }

    #[test]
    fn test_unsubscribed_read_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = bus(&dir).read("ghost", 1, None).unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { .. }));
    }

    #[test]
    fn test_prune_drops_processed_entries() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        bus.subscribe("a", topics(&[Topic::System]), None).unwrap();
        bus.publish(Topic::System, json!("x"), Publisher::system(), MessageMetadata::default())
            .unwrap();
        bus.read("a", 1, None).unwrap();

        let report = bus.prune(Duration::ZERO).unwrap();
        assert_eq!(report.queue_entries_removed, 1);
        assert_eq!(report.messages_removed, 1);
    }
}
