use super::{parse_value, print_json, Command, CommandContext};
use anyhow::{bail, Context, Result};
use clap::{Subcommand, ValueEnum};
use concord::{CoordinationError, StateWrite, Transform, VectorClock};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TransformOp {
    Increment,
    Append,
    Merge,
    Replace,
}

#[derive(Subcommand)]
pub enum StateAction {
    /// Read one key, or the whole namespace
    Get {
        namespace: String,
        key: Option<String>,
    },
    /// Write a value (JSON, or a plain string)
    Set {
        namespace: String,
        key: String,
        value: String,
        /// Vector clock the write is based on, as a JSON object
        #[arg(long, help = "Reject or merge the write unless it is causally after the stored clock")]
        clock: Option<String>,
    },
    /// Apply a typed transform to the current value
    Update {
        namespace: String,
        key: String,
        #[arg(value_enum)]
        op: TransformOp,
        value: String,
    },
    /// Remove a key
    Delete { namespace: String, key: String },
    /// Save the namespace under a new snapshot id
    Snapshot {
        namespace: String,
        #[arg(long, default_value = "manual snapshot")]
        description: String,
    },
    /// Replace the namespace with a snapshot
    Restore { namespace: String, snapshot_id: String },
    /// List snapshots of a namespace
    Snapshots { namespace: String },
    /// Key count, journal size, clock and snapshots of a namespace
    Inspect { namespace: String },
    /// List namespaces
    Namespaces,
    /// Show the journal, optionally for one key
    Journal {
        namespace: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Show the namespace clock, or one key's clock
    Clock {
        namespace: String,
        #[arg(long)]
        key: Option<String>,
    },
}

fn build_transform(op: TransformOp, raw: &str) -> Result<Transform> {
    let value = parse_value(raw);
    Ok(match (op, value) {
        (TransformOp::Increment, Value::Number(n)) => Transform::Increment(n),
        (TransformOp::Increment, other) => bail!("increment needs a number, got {other}"),
        (TransformOp::Append, item) => Transform::Append(item),
        (TransformOp::Merge, Value::Object(fields)) => Transform::Merge(fields),
        (TransformOp::Merge, other) => bail!("merge needs a JSON object, got {other}"),
        (TransformOp::Replace, value) => Transform::Replace(value),
    })
}

impl Command for StateAction {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let coordinator = &ctx.coordinator;
        let agent = &ctx.agent;

        match self {
            StateAction::Get { namespace, key } => {
                let value = coordinator.get(agent, namespace, key.as_deref())?;
                print_json(&json!({ "namespace": namespace, "key": key, "value": value }))
            }
            StateAction::Set { namespace, key, value, clock: None } => {
                let previous = coordinator.set(agent, namespace, key, parse_value(value)).await?;
                print_json(&json!({ "namespace": namespace, "key": key, "previous": previous }))
            }
            StateAction::Set { namespace, key, value, clock: Some(raw) } => {
                let clock: VectorClock = serde_json::from_str(raw).context("--clock must be a JSON object of counters")?;
                let outcome = coordinator
                    .set_with_clock(agent, namespace, key, parse_value(value), clock)
                    .await?;
                print_json(&outcome)?;
                if let StateWrite::Conflict { conflict } = outcome {
                    return Err(CoordinationError::ConflictDetected {
                        conflict_id: conflict.conflict_id,
                    }
                    .into());
                }
                Ok(())
            }
            StateAction::Update { namespace, key, op, value } => {
                let transform = build_transform(*op, value)?;
                let value = coordinator.update(agent, namespace, key, &transform).await?;
                print_json(&json!({ "namespace": namespace, "key": key, "value": value }))
            }
            StateAction::Delete { namespace, key } => {
                let removed = coordinator.delete(agent, namespace, key).await?;
                print_json(&json!({ "namespace": namespace, "key": key, "removed": removed }))
            }
            StateAction::Snapshot { namespace, description } => {
                let snapshot = coordinator.snapshot(agent, namespace, description).await?;
                print_json(&snapshot.info())
            }
            StateAction::Restore { namespace, snapshot_id } => {
                let undo = coordinator.restore(agent, namespace, snapshot_id).await?;
                print_json(&json!({ "restored": snapshot_id, "undo_snapshot": undo.snapshot_id }))
            }
            StateAction::Snapshots { namespace } => print_json(&coordinator.snapshots(agent, namespace)?),
            StateAction::Inspect { namespace } => print_json(&coordinator.inspect(agent, namespace)?),
            StateAction::Namespaces => print_json(&coordinator.namespaces(agent)?),
            StateAction::Journal { namespace, key } => {
                print_json(&coordinator.journal(agent, namespace, key.as_deref())?)
            }
            StateAction::Clock { namespace, key } => {
                print_json(&coordinator.clock(agent, namespace, key.as_deref())?)
            }
        }
    }
}
