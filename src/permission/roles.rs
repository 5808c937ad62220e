use super::{tools, DelegationRule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Broad role class; decides what a role may do when a tool is in neither
/// of its explicit lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleClass {
    /// Plans and delegates; never mutates files or state directly.
    Orchestration,
    /// Does the work; never delegates.
    Execution,
    /// Reads and reports only.
    Analysis,
    /// Unknown agents: read-only tools only.
    General,
}

impl fmt::Display for RoleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleClass::Orchestration => write!(f, "orchestration"),
            RoleClass::Execution => write!(f, "execution"),
            RoleClass::Analysis => write!(f, "analysis"),
            RoleClass::General => write!(f, "general"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub role_name: String,
    pub class: RoleClass,
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    #[serde(default)]
    pub forbidden_tools: BTreeSet<String>,
    /// Regexes (or plain keywords) on operation text that mean the work
    /// must be handed to another role.
    #[serde(default)]
    pub delegation_patterns: Vec<String>,
}

impl RoleDefinition {
    pub fn new(role_name: &str, class: RoleClass) -> Self {
        Self {
            role_name: role_name.to_string(),
            class,
            allowed_tools: BTreeSet::new(),
            forbidden_tools: BTreeSet::new(),
            delegation_patterns: Vec::new(),
        }
    }

    /// Minimal read-only role handed to unknown agent types.
    pub fn general(role_name: &str) -> Self {
        Self::new(role_name, RoleClass::General)
    }

    fn allow(mut self, tools: &[&str]) -> Self {
        self.allowed_tools.extend(tools.iter().map(|t| t.to_string()));
        self
    }

    fn forbid(mut self, tools: &[&str]) -> Self {
        self.forbidden_tools.extend(tools.iter().map(|t| t.to_string()));
        self
    }

    fn delegate_on(mut self, patterns: &[&str]) -> Self {
        self.delegation_patterns
            .extend(patterns.iter().map(|p| p.to_string()));
        self
    }
}

const FILE_WRITES: [&str; 4] = ["Write", "Edit", "MultiEdit", "NotebookEdit"];
const LOOKUPS: [&str; 4] = ["Read", "Grep", "Glob", "LS"];

fn executor(name: &str) -> RoleDefinition {
    RoleDefinition::new(name, RoleClass::Execution)
        .allow(&LOOKUPS)
        .allow(&FILE_WRITES)
        .allow(&["Bash"])
        .allow(&[
            tools::STATE_READ,
            tools::STATE_WRITE,
            tools::RESOURCE_CLAIM,
            tools::TASK_CLAIM,
            tools::PUBLISH,
            tools::SUBSCRIBE,
        ])
        .forbid(&["Task"])
}

fn analyst(name: &str) -> RoleDefinition {
    RoleDefinition::new(name, RoleClass::Analysis)
        .allow(&LOOKUPS)
        .allow(&["WebFetch", "WebSearch"])
        .allow(&[
            tools::STATE_READ,
            tools::RESOURCE_CLAIM,
            tools::TASK_CLAIM,
            tools::PUBLISH,
            tools::SUBSCRIBE,
        ])
        .forbid(&FILE_WRITES)
        .forbid(&["Task"])
}

fn planner(name: &str) -> RoleDefinition {
    RoleDefinition::new(name, RoleClass::Orchestration)
        .allow(&LOOKUPS)
        .allow(&["Task", "TodoWrite", "WebFetch", "WebSearch"])
        .allow(&[
            tools::STATE_READ,
            tools::TASK_CLAIM,
            tools::CONFLICT_RESOLVE,
            tools::PUBLISH,
            tools::SUBSCRIBE,
        ])
        .forbid(&FILE_WRITES)
        .delegate_on(&[
            r"\b(implement|write|edit|create|refactor|build)\b",
            r"\b(fix|debug|test|document|optimi[sz]e)\b",
        ])
}

/// Built-in role table.
pub fn default_roles() -> Vec<RoleDefinition> {
    let mut researcher = analyst("researcher");
    researcher.allowed_tools.insert(tools::STATE_WRITE.to_string());

    vec![
        planner("orchestrator"),
        planner("architect"),
        analyst("reviewer"),
        executor("debugger"),
        analyst("analyzer"),
        executor("tester"),
        executor("coder"),
        researcher,
        executor("documenter"),
        executor("optimizer"),
    ]
}

/// Keyword vocabulary for picking a delegate, checked in order.
pub fn default_delegation_rules() -> Vec<DelegationRule> {
    let rule = |role: &str, keywords: &[&str]| DelegationRule {
        role: role.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    };
    vec![
        rule("tester", &["test", "spec", "coverage", "assert"]),
        rule("debugger", &["debug", "bug", "fix", "error", "crash"]),
        rule("documenter", &["document", "readme", "docs", "comment"]),
        rule("optimizer", &["optimi", "performance", "speed", "profil"]),
        rule("reviewer", &["review", "audit"]),
        rule("coder", &["implement", "write", "edit", "code", "create", "refactor", "build"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_has_every_ranked_role() {
        let roles = default_roles();
        for name in [
            "orchestrator", "architect", "reviewer", "debugger", "analyzer",
            "tester", "coder", "researcher", "documenter", "optimizer",
        ] {
            assert!(roles.iter().any(|r| r.role_name == name), "missing {name}");
        }
    }

    #[test]
    fn test_orchestrator_forbids_file_writes() {
        let roles = default_roles();
        let orchestrator = roles.iter().find(|r| r.role_name == "orchestrator").unwrap();
        assert_eq!(orchestrator.class, RoleClass::Orchestration);
        assert!(orchestrator.forbidden_tools.contains("Write"));
        assert!(orchestrator.allowed_tools.contains("Task"));
    }
}
