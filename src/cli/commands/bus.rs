use super::{parse_value, print_json, Command, CommandContext};
use anyhow::Result;
use clap::{Args, Subcommand};
use concord::{SubscriptionFilter, Topic};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;

/// Typed filter flags shared by subscribe, update and filter.
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Only messages from these publisher types
    #[arg(long = "publisher-type", value_delimiter = ',')]
    pub publisher_types: Vec<String>,
    /// Only messages from these publisher ids
    #[arg(long = "publisher-id", value_delimiter = ',')]
    pub publisher_ids: Vec<String>,
    /// Only messages tagged with this task id
    #[arg(long = "for-task")]
    pub task_id: Option<String>,
    /// Only messages tagged with this session id
    #[arg(long = "for-session")]
    pub session_id: Option<String>,
}

impl FilterArgs {
    fn into_filter(self, topics: Vec<Topic>) -> Option<SubscriptionFilter> {
        let filter = SubscriptionFilter {
            topics,
            publisher_types: self.publisher_types,
            publisher_ids: self.publisher_ids,
            task_id: self.task_id,
            session_id: self.session_id,
        };
        (filter != SubscriptionFilter::default()).then_some(filter)
    }
}

#[derive(Subcommand)]
pub enum BusAction {
    /// Publish a JSON payload on a topic
    Publish { topic: Topic, payload: String },
    /// Create or replace this agent's subscription
    Subscribe {
        #[arg(required = true, value_delimiter = ',')]
        topics: Vec<Topic>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Change topics or filter of this agent's subscription
    Update {
        #[arg(long, value_delimiter = ',')]
        topics: Option<Vec<Topic>>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Remove this agent's subscription and queue
    Unsubscribe,
    /// Consume queued messages
    Read {
        #[arg(long, default_value = "10")]
        count: usize,
        #[arg(long)]
        topic: Option<Topic>,
    },
    /// Show queued messages matching a filter without consuming them
    Filter {
        #[arg(long, value_delimiter = ',')]
        topics: Vec<Topic>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Block until a message arrives
    Wait {
        /// Seconds to wait (defaults to bus.default_wait_timeout_seconds)
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        topic: Option<Topic>,
    },
    /// List all subscriptions
    List,
    /// Count unread messages for this agent
    Pending,
    /// Drop processed queue entries and old messages
    Prune {
        #[arg(long)]
        retention_seconds: Option<u64>,
    },
}

impl Command for BusAction {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let coordinator = &ctx.coordinator;
        let agent = &ctx.agent;

        match self {
            BusAction::Publish { topic, payload } => {
                let message_id = coordinator.publish(agent, *topic, parse_value(payload))?;
                print_json(&json!({ "message_id": message_id, "topic": topic }))
            }
            BusAction::Subscribe { topics, filter } => {
                let set: BTreeSet<Topic> = topics.iter().copied().collect();
                let filter = filter.clone().into_filter(Vec::new());
                print_json(&coordinator.subscribe(agent, set, filter)?)
            }
            BusAction::Update { topics, filter } => {
                let set = topics.as_ref().map(|t| t.iter().copied().collect::<BTreeSet<Topic>>());
                let filter = filter.clone().into_filter(Vec::new());
                print_json(&coordinator.update_subscription(agent, set, filter)?)
            }
            BusAction::Unsubscribe => {
                let removed = coordinator.unsubscribe(agent)?;
                print_json(&json!({ "agent_id": agent.agent_id, "removed": removed }))
            }
            BusAction::Read { count, topic } => print_json(&coordinator.read(agent, *count, *topic)?),
            BusAction::Filter { topics, filter } => {
                let filter = filter.clone().into_filter(topics.clone()).unwrap_or_default();
                print_json(&coordinator.filter(agent, &filter)?)
            }
            BusAction::Wait { timeout, topic } => {
                let seconds = timeout.unwrap_or(coordinator.config().bus.default_wait_timeout_seconds);
                let message = coordinator
                    .wait(agent, Duration::from_secs(seconds), *topic)
                    .await?;
                print_json(&message)
            }
            BusAction::List => print_json(&coordinator.subscriptions()?),
            BusAction::Pending => {
                let pending = coordinator.pending(agent)?;
                print_json(&json!({ "agent_id": agent.agent_id, "pending": pending }))
            }
            BusAction::Prune { retention_seconds } => {
                print_json(&coordinator.prune(retention_seconds.map(Duration::from_secs))?)
            }
        }
    }
}
