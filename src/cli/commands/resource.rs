use super::{print_json, report_claim, Command, CommandContext};
use anyhow::Result;
use clap::Subcommand;
use concord::LeaseOperation;

#[derive(Subcommand)]
pub enum ResourceAction {
    /// Claim a resource such as `file /src/app.rs`
    Claim {
        resource_type: String,
        path: String,
        /// read, modify or delete
        #[arg(long, default_value = "modify")]
        operation: LeaseOperation,
        /// Lease lifetime in seconds (defaults to locks.default_ttl_seconds)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Release a resource claim and hand it to the next waiter
    Release { resource_type: String, path: String },
    /// Extend a held lease by its lease id
    Renew {
        resource_type: String,
        path: String,
        lease_id: u64,
    },
    /// Claim a task
    TaskClaim {
        task_id: String,
        #[arg(long, default_value = "general")]
        task_type: String,
    },
    /// Release a task, passing it to the first waiter
    TaskRelease { task_id: String },
    /// Show resource leases, task claims and wait queues
    List,
    /// Drop expired leases and run pending hand-offs
    Cleanup,
}

impl Command for ResourceAction {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let coordinator = &ctx.coordinator;
        let agent = &ctx.agent;

        match self {
            ResourceAction::Claim { resource_type, path, operation, ttl } => {
                let outcome = coordinator
                    .claim_resource(agent, resource_type, path, *operation, *ttl)
                    .await?;
                report_claim(&outcome)
            }
            ResourceAction::Release { resource_type, path } => {
                print_json(&coordinator.release_resource(agent, resource_type, path)?)
            }
            ResourceAction::Renew { resource_type, path, lease_id } => {
                print_json(&coordinator.renew(agent, resource_type, path, *lease_id)?)
            }
            ResourceAction::TaskClaim { task_id, task_type } => {
                let outcome = coordinator.claim_task(agent, task_id, task_type).await?;
                report_claim(&outcome)
            }
            ResourceAction::TaskRelease { task_id } => {
                print_json(&coordinator.release_task(agent, task_id)?)
            }
            ResourceAction::List => print_json(&coordinator.list_claims()?),
            ResourceAction::Cleanup => print_json(&coordinator.cleanup()?),
        }
    }
}
