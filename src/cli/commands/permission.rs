use super::{print_json, Command, CommandContext};
use anyhow::Result;
use clap::Subcommand;
use concord::AgentContext;
use serde_json::json;

#[derive(Subcommand)]
pub enum PermissionAction {
    /// Check whether the calling agent may use a tool
    Check {
        tool: String,
        /// Check as this role instead of --agent-type
        #[arg(long = "as")]
        as_type: Option<String>,
        /// What the tool would be used for; drives the delegation suggestion
        #[arg(long)]
        operation: Option<String>,
    },
    /// Whether an operation must be delegated by this role
    RequiresDelegation { operation: String },
    /// Show a role definition (unknown roles get the read-only default)
    Role { agent_type: Option<String> },
    /// List all role definitions
    Roles,
    /// List recorded violations
    Violations {
        #[arg(long)]
        agent_type: Option<String>,
    },
    /// Summarize violations and delegation suggestions
    Analyze,
}

impl Command for PermissionAction {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let coordinator = &ctx.coordinator;
        let permissions = coordinator.permissions();

        match self {
            PermissionAction::Check { tool, as_type, operation } => {
                let agent = match as_type {
                    Some(agent_type) => AgentContext::new(ctx.agent.agent_id.clone(), agent_type.clone()),
                    None => ctx.agent.clone(),
                };
                let decision = coordinator.check(&agent, tool, operation.as_deref())?;
                print_json(&decision)?;
                decision.into_result(&agent.agent_type, tool)?;
                Ok(())
            }
            PermissionAction::RequiresDelegation { operation } => print_json(&json!({
                "agent_type": ctx.agent.agent_type,
                "operation": operation,
                "requires_delegation": permissions.requires_delegation(&ctx.agent.agent_type, operation),
                "suggested_role": permissions.suggest_delegate(operation).0,
            })),
            PermissionAction::Role { agent_type } => {
                print_json(&permissions.role(agent_type.as_deref().unwrap_or(&ctx.agent.agent_type)))
            }
            PermissionAction::Roles => print_json(&permissions.roles()),
            PermissionAction::Violations { agent_type } => {
                print_json(&permissions.violations(agent_type.as_deref())?)
            }
            PermissionAction::Analyze => print_json(&permissions.analyze()?),
        }
    }
}
