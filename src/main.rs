use anyhow::Result;
use clap::Parser;
use concord::{init_telemetry, AgentContext, ConcordConfig, CoordinationError, Coordinator};
use std::process::ExitCode;

mod cli;

use cli::commands::{default_agent_id, Command, CommandContext};
use cli::{Cli, Commands};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<CoordinationError>()
                .map_or(1, CoordinationError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    ConcordConfig::load_env_file()?;
    let mut config = ConcordConfig::load_from(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config = config.with_root(root.clone());
    }
    init_telemetry(&config.observability)?;

    let mut agent = AgentContext::new(
        cli.agent_id.clone().unwrap_or_else(default_agent_id),
        cli.agent_type.to_lowercase(),
    );
    agent.session_id = cli.session_id.clone();
    agent.task_id = cli.task_id.clone();

    let ctx = CommandContext {
        coordinator: Coordinator::open(config)?,
        agent,
    };

    match &cli.command {
        Commands::State { action } => action.execute(&ctx).await,
        Commands::Resource { action } => action.execute(&ctx).await,
        Commands::Conflict { action } => action.execute(&ctx).await,
        Commands::Bus { action } => action.execute(&ctx).await,
        Commands::Permission { action } => action.execute(&ctx).await,
        Commands::Config { action } => action.execute(&ctx).await,
    }
}
