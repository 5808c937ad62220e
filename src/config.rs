use crate::conflict::{ConflictType, ResolutionStrategy};
use crate::error::{CoordinationError, Result};
use crate::permission::{DelegationRule, RoleDefinition};
use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure for concord
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConcordConfig {
    /// Where coordination records live
    pub storage: StorageConfig,
    /// Lease timing
    pub locks: LockConfig,
    /// Conflict policy
    pub conflicts: ConflictConfig,
    /// Message bus settings
    pub bus: BusConfig,
    /// Role priorities used by priority-based resolution
    pub priorities: PriorityTable,
    /// Tool classification and delegation vocabulary
    pub permissions: PermissionConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the shared coordination tree
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".concord"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL applied to resource claims that do not specify one
    pub default_ttl_seconds: u64,
    /// Upper bound on a blocking acquire
    pub acquire_timeout_ms: u64,
    /// First retry delay
    pub backoff_min_ms: u64,
    /// Retry delay ceiling
    pub backoff_max_ms: u64,
    /// TTL of the per-namespace lease held during a state mutation
    pub namespace_lease_ttl_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            acquire_timeout_ms: 5_000,
            backoff_min_ms: 10,
            backoff_max_ms: 250,
            namespace_lease_ttl_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Resolve new conflicts as soon as they are detected
    pub auto_resolve: bool,
    /// Refuse any contention involving a delete
    pub block_delete: bool,
    /// Monitor polling interval
    pub monitor_interval_seconds: u64,
    /// Slot length handed out by time-share rotations
    pub time_share_slot_seconds: u64,
    /// Default strategy per conflict type
    pub rules: ConflictRules,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            auto_resolve: false,
            block_delete: true,
            monitor_interval_seconds: 5,
            time_share_slot_seconds: 300,
            rules: ConflictRules::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConflictRules {
    pub resource_contention: ResolutionStrategy,
    pub task_assignment: ResolutionStrategy,
    pub state_conflict: ResolutionStrategy,
}

impl Default for ConflictRules {
    fn default() -> Self {
        Self {
            resource_contention: ResolutionStrategy::PriorityBased,
            task_assignment: ResolutionStrategy::PriorityBased,
            state_conflict: ResolutionStrategy::Merge,
        }
    }
}

impl ConflictRules {
    pub fn strategy_for(&self, conflict_type: ConflictType) -> ResolutionStrategy {
        match conflict_type {
            ConflictType::ResourceContention => self.resource_contention,
            ConflictType::TaskAssignment => self.task_assignment,
            ConflictType::StateConflict => self.state_conflict,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// How long processed queue entries and messages are kept
    pub retention_seconds: u64,
    /// How often a waiting subscriber re-reads its queue file
    pub wait_poll_interval_ms: u64,
    /// Wait timeout used when the caller gives none
    pub default_wait_timeout_seconds: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 86_400,
            wait_poll_interval_ms: 200,
            default_wait_timeout_seconds: 30,
        }
    }
}

/// Role name -> priority. Entries from configuration override the built-in
/// hierarchy instead of replacing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PriorityTable(BTreeMap<String, u32>);

pub const DEFAULT_PRIORITY_KEY: &str = "default";

impl Default for PriorityTable {
    fn default() -> Self {
        let table = [
            ("orchestrator", 100),
            ("architect", 90),
            ("reviewer", 80),
            ("debugger", 75),
            ("analyzer", 70),
            ("tester", 65),
            ("coder", 60),
            ("researcher", 50),
            ("documenter", 40),
            ("optimizer", 30),
            (DEFAULT_PRIORITY_KEY, 10),
        ];
        Self(
            table
                .into_iter()
                .map(|(role, priority)| (role.to_string(), priority))
                .collect(),
        )
    }
}

impl<'de> Deserialize<'de> for PriorityTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let overrides = BTreeMap::<String, u32>::deserialize(deserializer)?;
        let mut table = Self::default();
        table
            .0
            .extend(overrides.into_iter().map(|(k, v)| (k.to_lowercase(), v)));
        Ok(table)
    }
}

impl PriorityTable {
    /// Priority of a role; unknown roles get the `default` entry.
    pub fn get(&self, agent_type: &str) -> u32 {
        self.0
            .get(&agent_type.to_lowercase())
            .or_else(|| self.0.get(DEFAULT_PRIORITY_KEY))
            .copied()
            .unwrap_or(10)
    }

    pub fn set(&mut self, agent_type: &str, priority: u32) {
        self.0.insert(agent_type.to_lowercase(), priority);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Tools that mutate files or shared state
    pub mutating_tools: Vec<String>,
    /// Tools that spawn or delegate to other agents
    pub delegating_tools: Vec<String>,
    /// Tools the general class may always use
    pub read_only_tools: Vec<String>,
    /// Ordered keyword vocabulary for delegation suggestions
    pub delegation_rules: Vec<DelegationRule>,
    /// Role suggested when no keyword matches
    pub default_executor: String,
    /// Role definitions replacing the built-in ones with the same name
    pub roles: Vec<RoleDefinition>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            mutating_tools: strings(&["Write", "Edit", "MultiEdit", "NotebookEdit", "StateWrite"]),
            delegating_tools: strings(&["Task"]),
            read_only_tools: strings(&[
                "Read",
                "Grep",
                "Glob",
                "LS",
                "WebFetch",
                "WebSearch",
                "StateRead",
                "Subscribe",
            ]),
            delegation_rules: crate::permission::roles::default_delegation_rules(),
            default_executor: "coder".to_string(),
            roles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON log lines instead of plain text
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

impl ConcordConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (concord.toml, .concord-rc, or an explicit path)
    /// 3. Environment variables (CONCORD_SECTION__FIELD)
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    pub fn load_from(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("concord.toml").exists() {
            builder = builder.add_source(File::with_name("concord"));
        }

        if Path::new(".concord-rc").exists() {
            builder = builder.add_source(
                File::with_name(".concord-rc").format(config::FileFormat::Toml),
            );
        }

        if let Some(path) = explicit {
            if !path.exists() {
                return Err(CoordinationError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("CONCORD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| CoordinationError::Config(e.to_string()))?;

        let concord_config: ConcordConfig = config
            .try_deserialize()
            .map_err(|e| CoordinationError::Config(e.to_string()))?;

        concord_config.validate()?;
        Ok(concord_config)
    }

    /// Reject settings that would make leases or waits misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.locks.backoff_min_ms == 0 || self.locks.backoff_min_ms > self.locks.backoff_max_ms {
            return Err(CoordinationError::Config(
                "locks.backoff_min_ms must be positive and <= locks.backoff_max_ms".to_string(),
            ));
        }
        if self.bus.wait_poll_interval_ms == 0 {
            return Err(CoordinationError::Config(
                "bus.wait_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.conflicts.monitor_interval_seconds == 0 {
            return Err(CoordinationError::Config(
                "conflicts.monitor_interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Use a different storage root, keeping everything else.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage.root = root.into();
        self
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content =
            toml::to_string_pretty(self).map_err(|e| CoordinationError::Config(e.to_string()))?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv().map_err(|e| CoordinationError::Config(e.to_string()))?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_priorities_follow_role_hierarchy() {
        let table = PriorityTable::default();
        assert_eq!(table.get("orchestrator"), 100);
        assert_eq!(table.get("Coder"), 60);
        assert_eq!(table.get("optimizer"), 30);
        assert_eq!(table.get("nobody"), 10);
    }

    #[test]
    fn test_priority_overrides_merge_onto_defaults() {
        let table: PriorityTable = serde_json::from_str(r#"{"coder": 95}"#).unwrap();
        assert_eq!(table.get("coder"), 95);
        assert_eq!(table.get("architect"), 90);
    }

    #[test]
    fn test_rules_pick_strategy_per_type() {
        let rules = ConflictRules::default();
        assert_eq!(
            rules.strategy_for(ConflictType::ResourceContention),
            ResolutionStrategy::PriorityBased
        );
        assert_eq!(
            rules.strategy_for(ConflictType::StateConflict),
            ResolutionStrategy::Merge
        );
    }

    #[test]
    fn test_save_and_load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("concord.toml");

        let mut config = ConcordConfig::default().with_root(dir.path().join("tree"));
        config.conflicts.auto_resolve = true;
        config.priorities.set("coder", 77);
        config.save_to_file(&path).unwrap();

        let loaded = ConcordConfig::load_from(Some(&path)).unwrap();
        assert!(loaded.conflicts.auto_resolve);
        assert_eq!(loaded.priorities.get("coder"), 77);
        assert_eq!(loaded.storage.root, dir.path().join("tree"));
    }

    #[test]
    fn test_missing_explicit_file_is_config_error() {
        let err = ConcordConfig::load_from(Some(Path::new("/nonexistent/concord.toml"))).unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = ConcordConfig::default();
        config.locks.backoff_min_ms = 500;
        config.locks.backoff_max_ms = 100;
        assert!(config.validate().is_err());
    }
}
