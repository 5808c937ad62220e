use super::{print_json, Command, CommandContext};
use anyhow::Result;
use clap::Subcommand;
use concord::{ConflictStatus, ConflictType, ResolutionStrategy};
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Subcommand)]
pub enum ConflictAction {
    /// List conflicts, optionally by status
    List {
        #[arg(long)]
        status: Option<ConflictStatus>,
    },
    /// Show one conflict
    Show { conflict_id: String },
    /// Resolve one conflict
    Resolve {
        conflict_id: String,
        /// Strategy to apply (defaults to the configured rule)
        #[arg(long)]
        strategy: Option<ResolutionStrategy>,
    },
    /// Resolve every active conflict
    ResolveAll {
        #[arg(long)]
        strategy: Option<ResolutionStrategy>,
        /// Only conflicts of this type
        #[arg(long = "type")]
        conflict_type: Option<ConflictType>,
    },
    /// Watch for new conflicts until interrupted
    Monitor {
        /// Stop after this many passes
        #[arg(long)]
        iterations: Option<u32>,
        /// Seconds between passes (defaults to conflicts.monitor_interval_seconds)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
        /// Resolve new conflicts instead of alerting
        #[arg(long)]
        auto_resolve: bool,
    },
    /// Show the priority table, or one role's priority
    Priority { agent_type: Option<String> },
    /// Show the default strategy per conflict type
    Rules,
    /// Show past resolutions
    History,
}

impl Command for ConflictAction {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let coordinator = &ctx.coordinator;
        let agent = &ctx.agent;

        match self {
            ConflictAction::List { status } => print_json(&coordinator.conflicts(*status)?),
            ConflictAction::Show { conflict_id } => print_json(&coordinator.conflict(conflict_id)?),
            ConflictAction::Resolve { conflict_id, strategy } => {
                let strategy = match strategy {
                    Some(strategy) => *strategy,
                    None => coordinator
                        .resolver()
                        .auto_strategy(&coordinator.conflict(conflict_id)?),
                };
                print_json(&coordinator.resolve(agent, conflict_id, strategy).await?)
            }
            ConflictAction::ResolveAll { strategy, conflict_type } => {
                print_json(&coordinator.resolve_all(agent, *strategy, *conflict_type).await?)
            }
            ConflictAction::Monitor { iterations, interval, auto_resolve } => {
                let mut monitor = coordinator.monitor();
                if *auto_resolve {
                    monitor = monitor.with_auto_resolve(true);
                }
                let interval = Duration::from_secs(
                    interval.unwrap_or(coordinator.config().conflicts.monitor_interval_seconds),
                );
                monitor = monitor.with_interval(interval);

                if let Some(iterations) = iterations {
                    for pass in 0..*iterations {
                        if pass > 0 {
                            tokio::time::sleep(interval).await;
                        }
                        print_json(&monitor.poll_once().await?)?;
                    }
                    return Ok(());
                }

                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received, stopping monitor");
                        let _ = shutdown_tx.send(true);
                    }
                });
                monitor.run(shutdown_rx).await?;
                Ok(())
            }
            ConflictAction::Priority { agent_type: Some(agent_type) } => print_json(&json!({
                "agent_type": agent_type,
                "priority": coordinator.priority(agent_type),
            })),
            ConflictAction::Priority { agent_type: None } => {
                print_json(&coordinator.config().priorities)
            }
            ConflictAction::Rules => print_json(&coordinator.rules()),
            ConflictAction::History => print_json(&coordinator.resolutions()?),
        }
    }
}
