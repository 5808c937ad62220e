use super::{print_json, Command, CommandContext};
use anyhow::Result;
use clap::Subcommand;
use serde_json::json;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the effective configuration as TOML
    Save {
        #[arg(default_value = "concord.toml")]
        path: PathBuf,
    },
}

impl Command for ConfigAction {
    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let config = ctx.coordinator.config();
        match self {
            ConfigAction::Show => print_json(config),
            ConfigAction::Save { path } => {
                config.save_to_file(path)?;
                print_json(&json!({ "saved": path }))
            }
        }
    }
}
