use anyhow::{Context, Result};
use concord::{AgentContext, ClaimOutcome, CoordinationError, Coordinator};
use serde::Serialize;
use serde_json::Value;

pub mod bus;
pub mod config;
pub mod conflict;
pub mod permission;
pub mod resource;
pub mod state;

/// Everything a subcommand needs: the opened services and the caller.
pub struct CommandContext {
    pub coordinator: Coordinator,
    pub agent: AgentContext,
}

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self, ctx: &CommandContext) -> Result<()>;
}

/// Pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("rendering output")?;
    println!("{rendered}");
    Ok(())
}

/// Parse a command-line value as JSON, falling back to a plain string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// `<host>-<pid>` for callers that did not name themselves.
pub fn default_agent_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}-{}", std::process::id())
}

/// Print a claim outcome; a conflict is reported and exits with the
/// conflict status.
pub fn report_claim<T: Serialize>(outcome: &ClaimOutcome<T>) -> Result<()> {
    print_json(outcome)?;
    match outcome.conflict() {
        Some(conflict) => Err(CoordinationError::ConflictDetected {
            conflict_id: conflict.conflict_id.clone(),
        }
        .into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value_prefers_json() {
        assert_eq!(parse_value("5"), json!(5));
        assert_eq!(parse_value("[1,2]"), json!([1, 2]));
        assert_eq!(parse_value("hello"), json!("hello"));
    }

    #[test]
    fn test_default_agent_id_carries_pid() {
        assert!(default_agent_id().ends_with(&std::process::id().to_string()));
    }
}
