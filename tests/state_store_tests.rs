// State store integration tests
// Journal, snapshots and failure isolation through the coordinator

use concord::state::{replay, JournalOperation};
use concord::{AgentContext, ConcordConfig, CoordinationError, Coordinator, Transform};
use proptest::prelude::*;
use proptest_derive::Arbitrary;
use serde_json::{json, Number};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Coordinator {
    Coordinator::open(ConcordConfig::default().with_root(dir.path())).unwrap()
}

#[tokio::test]
async fn test_counter_set_then_increment() {
    let dir = TempDir::new().unwrap();
    let coordinator = open(&dir);
    let coder = AgentContext::new("agent-1", "coder");

    coordinator.set(&coder, "app", "counter", json!(5)).await.unwrap();
    let value = coordinator
        .update(&coder, "app", "counter", &Transform::Increment(Number::from(1)))
        .await
        .unwrap();

    assert_eq!(value, json!(6));
    assert_eq!(coordinator.get(&coder, "app", Some("counter")).unwrap(), Some(json!(6)));

    let journal = coordinator.journal(&coder, "app", Some("counter")).unwrap();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[0].operation, JournalOperation::Set);
    assert_eq!(journal[1].operation, JournalOperation::Update);
    assert_eq!(journal[1].old_value, Some(json!(5)));
}

#[tokio::test]
async fn test_get_without_key_returns_whole_namespace() {
    let dir = TempDir::new().unwrap();
    let coordinator = open(&dir);
    let coder = AgentContext::new("agent-1", "coder");

    coordinator.set(&coder, "app", "a", json!(1)).await.unwrap();
    coordinator.set(&coder, "app", "b", json!("two")).await.unwrap();

    let all = coordinator.get(&coder, "app", None).unwrap();
    assert_eq!(all, Some(json!({"a": 1, "b": "two"})));
    assert_eq!(coordinator.get(&coder, "missing", Some("a")).unwrap(), None);
}

#[tokio::test]
async fn test_deleting_absent_key_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let coordinator = open(&dir);
    let coder = AgentContext::new("agent-1", "coder");

    coordinator.set(&coder, "app", "present", json!(true)).await.unwrap();
    assert_eq!(coordinator.delete(&coder, "app", "absent").await.unwrap(), None);
    assert_eq!(coordinator.journal(&coder, "app", None).unwrap().len(), 1);

    assert_eq!(coordinator.delete(&coder, "app", "present").await.unwrap(), Some(json!(true)));
    assert_eq!(coordinator.journal(&coder, "app", None).unwrap().len(), 2);
}

#[tokio::test]
async fn test_restore_returns_undo_snapshot() {
    let dir = TempDir::new().unwrap();
    let coordinator = open(&dir);
    let coder = AgentContext::new("agent-1", "coder");

    coordinator.set(&coder, "app", "phase", json!("design")).await.unwrap();
    let before = coordinator.snapshot(&coder, "app", "before build").await.unwrap();
    coordinator.set(&coder, "app", "phase", json!("build")).await.unwrap();

    let undo = coordinator.restore(&coder, "app", &before.snapshot_id).await.unwrap();
    assert_eq!(coordinator.get(&coder, "app", Some("phase")).unwrap(), Some(json!("design")));
    assert_eq!(undo.data.get("phase"), Some(&json!("build")));

    coordinator.restore(&coder, "app", &undo.snapshot_id).await.unwrap();
    assert_eq!(coordinator.get(&coder, "app", Some("phase")).unwrap(), Some(json!("build")));
    assert!(coordinator.snapshots(&coder, "app").unwrap().len() >= 3);
}

#[tokio::test]
async fn test_restore_unknown_snapshot_is_not_found() {
    let dir = TempDir::new().unwrap();
    let coordinator = open(&dir);
    let coder = AgentContext::new("agent-1", "coder");
    coordinator.set(&coder, "app", "k", json!(1)).await.unwrap();

    let err = coordinator.restore(&coder, "app", "nope").await.unwrap_err();
    assert!(matches!(err, CoordinationError::NotFound { .. }));
}

#[tokio::test]
async fn test_corrupt_namespace_does_not_affect_others() {
    let dir = TempDir::new().unwrap();
    let coordinator = open(&dir);
    let coder = AgentContext::new("agent-1", "coder");

    coordinator.set(&coder, "healthy", "k", json!(1)).await.unwrap();
    coordinator.set(&coder, "broken", "k", json!(1)).await.unwrap();
    std::fs::write(dir.path().join("state").join("broken").join("data.json"), "{not json").unwrap();

    let err = coordinator.get(&coder, "broken", Some("k")).unwrap_err();
    assert!(matches!(err, CoordinationError::Corrupt { .. }));

    coordinator.set(&coder, "healthy", "k", json!(2)).await.unwrap();
    assert_eq!(coordinator.get(&coder, "healthy", Some("k")).unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_invalid_namespace_is_rejected() {
    let dir = TempDir::new().unwrap();
    let coordinator = open(&dir);
    let coder = AgentContext::new("agent-1", "coder");

    let err = coordinator.set(&coder, "../escape", "k", json!(1)).await.unwrap_err();
    assert!(matches!(err, CoordinationError::Validation(_)));
}

#[tokio::test]
async fn test_mutations_broadcast_on_state_topic() {
    let dir = TempDir::new().unwrap();
    let coordinator = open(&dir);
    let writer = AgentContext::new("writer", "coder");
    let watcher = AgentContext::new("watcher", "reviewer");

    coordinator
        .subscribe(&watcher, [concord::Topic::State].into_iter().collect(), None)
        .unwrap();
    coordinator.set(&writer, "app", "k", json!(1)).await.unwrap();

    let messages = coordinator.read(&watcher, 10, None).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, concord::Topic::State);
    assert_eq!(messages[0].publisher.id, "writer");
}

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Set(#[proptest(strategy = "0usize..4")] usize, i64),
    Increment(#[proptest(strategy = "0usize..4")] usize, #[proptest(strategy = "-5i64..5")] i64),
    Delete(#[proptest(strategy = "0usize..4")] usize),
    Snapshot,
    RestoreLatest,
}

const KEYS: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_journal_replay_reproduces_key_map(ops in proptest::collection::vec(any::<Op>(), 1..20)) {
        let dir = TempDir::new().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let coordinator = open(&dir);
        let agent = AgentContext::new("prop", "coder");

        runtime.block_on(async {
            let mut last_snapshot = None;
            for op in &ops {
                match op {
                    Op::Set(k, v) => {
                        coordinator.set(&agent, "prop", KEYS[*k], json!(v)).await.unwrap();
                    }
                    Op::Increment(k, by) => {
                        coordinator
                            .update(&agent, "prop", KEYS[*k], &Transform::Increment(Number::from(*by)))
                            .await
                            .unwrap();
                    }
                    Op::Delete(k) => {
                        coordinator.delete(&agent, "prop", KEYS[*k]).await.unwrap();
                    }
                    Op::Snapshot => {
                        if coordinator.store().exists("prop") {
                            let snapshot = coordinator.snapshot(&agent, "prop", "prop").await.unwrap();
                            last_snapshot = Some(snapshot.snapshot_id);
                        }
                    }
                    Op::RestoreLatest => {
                        if let Some(id) = &last_snapshot {
                            coordinator.restore(&agent, "prop", id).await.unwrap();
                        }
                    }
                }
            }
        });

        if coordinator.store().exists("prop") {
            let journal = coordinator.journal(&agent, "prop", None).unwrap();
            let replayed = replay(&journal);
            prop_assert_eq!(replayed, coordinator.store().load("prop").unwrap());
        }
    }
}
