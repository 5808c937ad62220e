use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

use commands::{
    bus::BusAction, config::ConfigAction, conflict::ConflictAction,
    permission::PermissionAction, resource::ResourceAction, state::StateAction,
};

#[derive(Parser)]
#[command(name = "concord")]
#[command(about = "Shared state, leases and conflict resolution for cooperating agents")]
#[command(long_about = "Concord lets independent agent processes share namespaced state, claim \
                       resources and tasks, resolve conflicting claims by priority and exchange \
                       messages. Every command prints JSON on stdout.")]
pub struct Cli {
    /// Coordination root directory (overrides storage.root)
    #[arg(long, global = true, env = "CONCORD_ROOT")]
    pub root: Option<PathBuf>,

    /// Extra TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Identity of the calling agent (defaults to <host>-<pid>)
    #[arg(long, global = true, env = "CONCORD_AGENT_ID")]
    pub agent_id: Option<String>,

    /// Role of the calling agent
    #[arg(long, global = true, env = "CONCORD_AGENT_TYPE", default_value = "coder")]
    pub agent_type: String,

    /// Session id attached to published messages
    #[arg(long, global = true, env = "CONCORD_SESSION_ID")]
    pub session_id: Option<String>,

    /// Task id attached to published messages
    #[arg(long, global = true, env = "CONCORD_TASK_ID")]
    pub task_id: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read and write namespaced shared state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Claim and release resources and tasks
    Resource {
        #[command(subcommand)]
        action: ResourceAction,
    },
    /// Inspect and resolve conflicts
    Conflict {
        #[command(subcommand)]
        action: ConflictAction,
    },
    /// Publish and consume messages
    Bus {
        #[command(subcommand)]
        action: BusAction,
    },
    /// Check tool permissions and review violations
    Permission {
        #[command(subcommand)]
        action: PermissionAction,
    },
    /// Show or write the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}
