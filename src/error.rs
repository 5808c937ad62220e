use thiserror::Error;

/// Errors surfaced by the coordination core.
///
/// Lock timeouts, conflicts and permission denials are recoverable and are
/// returned as typed values; only `Corrupt` indicates damaged persisted state,
/// and it only affects the namespace or resource it names.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Lease on '{key}' not acquired within {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    #[error("Conflict detected: {conflict_id}")]
    ConflictDetected { conflict_id: String },

    #[error("Permission denied: {agent_type} may not use {tool}")]
    PermissionDenied {
        agent_type: String,
        tool: String,
        suggestion: Option<String>,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict {conflict_id} requires manual resolution: {reason}")]
    ManualResolutionRequired { conflict_id: String, reason: String },

    #[error("Corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Timed out after {waited_ms}ms waiting for {what}")]
    Timeout { what: String, waited_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

impl CoordinationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoordinationError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoordinationError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Lock/timeout and conflict conditions never take the caller down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoordinationError::LockTimeout { .. }
                | CoordinationError::ConflictDetected { .. }
                | CoordinationError::PermissionDenied { .. }
                | CoordinationError::ManualResolutionRequired { .. }
                | CoordinationError::Timeout { .. }
        )
    }

    /// Process exit code used by the CLI result contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoordinationError::ConflictDetected { .. }
            | CoordinationError::ManualResolutionRequired { .. } => 2,
            CoordinationError::PermissionDenied { .. } => 3,
            CoordinationError::LockTimeout { .. } | CoordinationError::Timeout { .. } => 4,
            _ => 1,
        }
    }
}
