//! Role-based gate in front of every tool an agent invokes.

pub mod roles;

pub use roles::{default_delegation_rules, default_roles, RoleClass, RoleDefinition};

use crate::config::PermissionConfig;
use crate::error::{CoordinationError, Result};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Tool names for the coordination operations themselves, so they can be
/// gated like any other tool.
pub mod tools {
    pub const STATE_READ: &str = "StateRead";
    pub const STATE_WRITE: &str = "StateWrite";
    pub const RESOURCE_CLAIM: &str = "ResourceClaim";
    pub const TASK_CLAIM: &str = "TaskClaim";
    pub const CONFLICT_RESOLVE: &str = "ConflictResolve";
    pub const PUBLISH: &str = "Publish";
    pub const SUBSCRIBE: &str = "Subscribe";
}

/// Keywords that route delegated work to an executor role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRule {
    pub role: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    /// Tool is on the role's forbidden list.
    ForbiddenTool,
    /// Tool is barred by the role's class.
    ClassRestriction,
    /// General roles may only use read-only tools.
    NotAllowed,
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationType::ForbiddenTool => write!(f, "forbidden_tool"),
            ViolationType::ClassRestriction => write!(f, "class_restriction"),
            ViolationType::NotAllowed => write!(f, "not_allowed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub agent_type: String,
    pub tool: String,
    pub violation_type: ViolationType,
    pub details: String,
    pub operation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationSuggestion {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub agent_type: String,
    pub tool: String,
    pub operation: Option<String>,
    pub suggested_role: String,
    /// Keyword that picked the role; `None` when the default executor was used.
    pub matched_keyword: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionDecision {
    Allowed {
        reason: String,
    },
    Forbidden {
        violation_type: ViolationType,
        reason: String,
        suggestion: Option<DelegationSuggestion>,
    },
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PermissionDecision::Allowed { .. })
    }

    /// Convert a denial into `PermissionDenied`.
    pub fn into_result(self, agent_type: &str, tool: &str) -> Result<()> {
        match self {
            PermissionDecision::Allowed { .. } => Ok(()),
            PermissionDecision::Forbidden { suggestion, .. } => {
                Err(CoordinationError::PermissionDenied {
                    agent_type: agent_type.to_string(),
                    tool: tool.to_string(),
                    suggestion: suggestion.map(|s| s.suggested_role),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViolationReport {
    pub total_violations: usize,
    pub by_agent_type: BTreeMap<String, usize>,
    pub by_tool: BTreeMap<String, usize>,
    pub by_violation_type: BTreeMap<String, usize>,
    pub suggested_roles: BTreeMap<String, usize>,
    /// Most frequently suggested delegate, ties broken by name.
    pub top_delegate: Option<String>,
}

/// Evaluates tool use against the role table and keeps the violation and
/// delegation logs.
#[derive(Debug)]
pub struct PermissionEnforcer {
    storage: Storage,
    config: PermissionConfig,
    roles: BTreeMap<String, RoleDefinition>,
    patterns: BTreeMap<String, Vec<Regex>>,
}

impl PermissionEnforcer {
    pub fn new(storage: Storage, config: PermissionConfig) -> Self {
        let mut roles: BTreeMap<String, RoleDefinition> = default_roles()
            .into_iter()
            .map(|role| (role.role_name.clone(), role))
            .collect();
        for role in &config.roles {
            roles.insert(role.role_name.to_lowercase(), role.clone());
        }

        let patterns = roles
            .iter()
            .map(|(name, role)| (name.clone(), compile_patterns(&role.delegation_patterns)))
            .collect();

        Self {
            storage,
            config,
            roles,
            patterns,
        }
    }

    /// Role for `agent_type`; unknown types get a read-only general role.
    pub fn role(&self, agent_type: &str) -> RoleDefinition {
        self.roles
            .get(&agent_type.to_lowercase())
            .cloned()
            .unwrap_or_else(|| RoleDefinition::general(&agent_type.to_lowercase()))
    }

    pub fn roles(&self) -> Vec<RoleDefinition> {
        self.roles.values().cloned().collect()
    }

    /// Pure evaluation without logging.
    pub fn evaluate(&self, agent_type: &str, tool: &str) -> std::result::Result<String, (ViolationType, String)> {
        let role = self.role(agent_type);
        let listed = |set: &std::collections::BTreeSet<String>| {
            set.iter().any(|t| t.eq_ignore_ascii_case(tool))
        };
        let in_list = |list: &[String]| list.iter().any(|t| t.eq_ignore_ascii_case(tool));

        if listed(&role.forbidden_tools) {
            return Err((
                ViolationType::ForbiddenTool,
                format!("{tool} is forbidden for {}", role.role_name),
            ));
        }
        if listed(&role.allowed_tools) {
            return Ok(format!("{tool} is allowed for {}", role.role_name));
        }

        let mutating = in_list(&self.config.mutating_tools);
        let delegating = in_list(&self.config.delegating_tools);
        let denied = match role.class {
            RoleClass::Orchestration if mutating => {
                Some((ViolationType::ClassRestriction, "orchestration roles do not mutate"))
            }
            RoleClass::Execution if delegating => {
                Some((ViolationType::ClassRestriction, "execution roles do not delegate"))
            }
            RoleClass::Analysis if mutating || delegating => Some((
                ViolationType::ClassRestriction,
                "analysis roles neither mutate nor delegate",
            )),
            RoleClass::General if !in_list(&self.config.read_only_tools) => {
                Some((ViolationType::NotAllowed, "general roles are read-only"))
            }
            _ => None,
        };

        match denied {
            Some((kind, why)) => Err((kind, format!("{tool}: {why} ({})", role.role_name))),
            None => Ok(format!("{tool} permitted by {} class default", role.class)),
        }
    }

    /// Check a tool use, recording a violation (and for orchestration roles a
    /// delegation suggestion) before a denial is returned.
    pub fn check(
        &self,
        agent_id: &str,
        agent_type: &str,
        tool: &str,
        operation: Option<&str>,
    ) -> Result<PermissionDecision> {
        let (violation_type, reason) = match self.evaluate(agent_type, tool) {
            Ok(reason) => {
                debug!(agent_type = %agent_type, tool = %tool, "tool use allowed");
                return Ok(PermissionDecision::Allowed { reason });
            }
            Err(denial) => denial,
        };

        let violation = Violation {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_lowercase(),
            tool: tool.to_string(),
            violation_type,
            details: reason.clone(),
            operation: operation.map(str::to_string),
        };
        self.storage
            .append_jsonl(&self.storage.path(&["permissions", "violations.jsonl"]), &violation)?;
        warn!(
            agent_id = %agent_id,
            agent_type = %agent_type,
            tool = %tool,
            violation_type = %violation_type,
            "permission violation"
        );

        let suggestion = if self.role(agent_type).class == RoleClass::Orchestration {
            let (role, keyword) = self.suggest_delegate(operation.unwrap_or(tool));
            let suggestion = DelegationSuggestion {
                timestamp: violation.timestamp,
                agent_id: agent_id.to_string(),
                agent_type: violation.agent_type.clone(),
                tool: tool.to_string(),
                operation: violation.operation.clone(),
                suggested_role: role,
                matched_keyword: keyword,
            };
            self.storage.append_jsonl(
                &self.storage.path(&["permissions", "delegations.jsonl"]),
                &suggestion,
            )?;
            info!(
                agent_type = %agent_type,
                tool = %tool,
                suggested_role = %suggestion.suggested_role,
                "delegation suggested"
            );
            Some(suggestion)
        } else {
            None
        };

        Ok(PermissionDecision::Forbidden {
            violation_type,
            reason,
            suggestion,
        })
    }

    /// Whether `operation_text` matches any of the role's delegation patterns.
    pub fn requires_delegation(&self, agent_type: &str, operation_text: &str) -> bool {
        self.patterns
            .get(&agent_type.to_lowercase())
            .is_some_and(|patterns| patterns.iter().any(|p| p.is_match(operation_text)))
    }

    /// Executor role for `text` plus the keyword that picked it.
    pub fn suggest_delegate(&self, text: &str) -> (String, Option<String>) {
        let text = text.to_lowercase();
        for rule in &self.config.delegation_rules {
            if let Some(keyword) = rule
                .keywords
                .iter()
                .find(|k| text.contains(&k.to_lowercase()))
            {
                return (rule.role.clone(), Some(keyword.clone()));
            }
        }
        (self.config.default_executor.clone(), None)
    }

    pub fn violations(&self, agent_type: Option<&str>) -> Result<Vec<Violation>> {
        let all: Vec<Violation> = self
            .storage
            .read_jsonl(&self.storage.path(&["permissions", "violations.jsonl"]))?;
        Ok(match agent_type {
            Some(kind) => all
                .into_iter()
                .filter(|v| v.agent_type.eq_ignore_ascii_case(kind))
                .collect(),
            None => all,
        })
    }

    pub fn delegations(&self) -> Result<Vec<DelegationSuggestion>> {
        self.storage
            .read_jsonl(&self.storage.path(&["permissions", "delegations.jsonl"]))
    }

    pub fn analyze(&self) -> Result<ViolationReport> {
        let mut report = ViolationReport::default();
        for violation in self.violations(None)? {
            report.total_violations += 1;
            *report.by_agent_type.entry(violation.agent_type).or_default() += 1;
            *report.by_tool.entry(violation.tool).or_default() += 1;
            *report
                .by_violation_type
                .entry(violation.violation_type.to_string())
                .or_default() += 1;
        }
        for suggestion in self.delegations()? {
            *report.suggested_roles.entry(suggestion.suggested_role).or_default() += 1;
        }
        report.top_delegate = report
            .suggested_roles
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(role, _)| role.clone());
        Ok(report)
    }
}

/// Case-insensitive regexes; a pattern that fails to compile is matched as
/// a literal instead.
fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .or_else(|_| {
                    RegexBuilder::new(&regex::escape(pattern))
                        .case_insensitive(true)
                        .build()
                })
                .ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn enforcer(dir: &TempDir) -> PermissionEnforcer {
        PermissionEnforcer::new(Storage::new(dir.path()), PermissionConfig::default())
    }

    #[test]
    fn test_orchestrator_write_is_forbidden_with_coder_suggestion() {
        let dir = TempDir::new().unwrap();
        let enforcer = enforcer(&dir);

        let decision = enforcer.check("o1", "orchestrator", "Write", None).unwrap();
        match decision {
            PermissionDecision::Forbidden { violation_type, suggestion, .. } => {
                assert_eq!(violation_type, ViolationType::ForbiddenTool);
                assert_eq!(suggestion.unwrap().suggested_role, "coder");
            }
            other => panic!("expected forbidden, got {other:?}"),
        }
        assert_eq!(enforcer.violations(Some("orchestrator")).unwrap().len(), 1);
        assert_eq!(enforcer.delegations().unwrap().len(), 1);
    }

    #[test]
    fn test_coder_write_is_allowed_and_not_logged() {
        let dir = TempDir::new().unwrap();
        let enforcer = enforcer(&dir);
        assert!(enforcer.check("c1", "coder", "Write", None).unwrap().is_allowed());
        assert!(enforcer.violations(None).unwrap().is_empty());
    }

    #[test]
    fn test_class_defaults_apply_to_unlisted_tools() {
        let dir = TempDir::new().unwrap();
        let enforcer = enforcer(&dir);

        let err = enforcer.evaluate("tester", "Task").unwrap_err();
        assert_eq!(err.0, ViolationType::ForbiddenTool);
        assert!(enforcer.evaluate("reviewer", "StateWrite").is_err());
        assert!(enforcer.evaluate("researcher", "StateWrite").is_ok());
        // Bash is unlisted for the orchestrator and neither mutating nor delegating.
        assert!(enforcer.evaluate("orchestrator", "Bash").is_ok());
    }

    #[test]
    fn test_unknown_agent_type_is_read_only() {
        let dir = TempDir::new().unwrap();
        let enforcer = enforcer(&dir);
        assert_eq!(enforcer.role("intern").class, RoleClass::General);
        assert!(enforcer.evaluate("intern", "Read").is_ok());
        let (kind, _) = enforcer.evaluate("intern", "Bash").unwrap_err();
        assert_eq!(kind, ViolationType::NotAllowed);
        let decision = enforcer.check("i1", "intern", "Write", None).unwrap();
        match decision {
            PermissionDecision::Forbidden { suggestion, .. } => assert!(suggestion.is_none()),
            other => panic!("expected forbidden, got {other:?}"),
        }
    }

    #[test]
    fn test_requires_delegation_uses_role_patterns() {
        let dir = TempDir::new().unwrap();
        let enforcer = enforcer(&dir);
        assert!(enforcer.requires_delegation("orchestrator", "Implement the login form"));
        assert!(!enforcer.requires_delegation("orchestrator", "summarize progress"));
        assert!(!enforcer.requires_delegation("coder", "implement it"));
    }

    #[test]
    fn test_suggestion_follows_keyword_order() {
        let dir = TempDir::new().unwrap();
        let enforcer = enforcer(&dir);
        assert_eq!(enforcer.suggest_delegate("add test coverage").0, "tester");
        assert_eq!(enforcer.suggest_delegate("fix crash on start").0, "debugger");
        let (role, keyword) = enforcer.suggest_delegate("ponder");
        assert_eq!(role, "coder");
        assert!(keyword.is_none());
    }

    #[test]
    fn test_invalid_pattern_falls_back_to_literal() {
        let patterns = compile_patterns(&["deploy(".to_string()]);
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].is_match("please DEPLOY( now"));
    }

    #[test]
    fn test_analyze_counts_and_top_delegate() {
        let dir = TempDir::new().unwrap();
        let enforcer = enforcer(&dir);
        enforcer.check("o1", "orchestrator", "Write", Some("write the parser")).unwrap();
        enforcer.check("o1", "orchestrator", "Edit", Some("fix the bug")).unwrap();
        enforcer.check("o2", "architect", "Edit", Some("refactor module")).unwrap();

        let report = enforcer.analyze().unwrap();
        assert_eq!(report.total_violations, 3);
        assert_eq!(report.by_agent_type["orchestrator"], 2);
        assert_eq!(report.by_tool["Edit"], 2);
        assert_eq!(report.suggested_roles["coder"], 2);
        assert_eq!(report.top_delegate.as_deref(), Some("coder"));
    }
}
