// Concord Library - coordination core for cooperating agent processes
// This exposes the services behind the CLI for embedding and testing

pub mod bus;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod lease;
pub mod permission;
pub mod state;
pub mod storage;
pub mod telemetry;

// Re-export key types for easy access
pub use bus::{Message, MessageBus, MessageMetadata, Publisher, Subscription, SubscriptionFilter, Topic};
pub use clock::{ClockOrdering, VectorClock};
pub use config::{ConcordConfig, PriorityTable};
pub use conflict::{
    ClaimOutcome, Conflict, ConflictDetector, ConflictMonitor, ConflictResolver, ConflictStatus,
    ConflictType, Resolution, ResolutionAction, ResolutionStrategy, Severity,
};
pub use coordinator::{AgentContext, Coordinator, StateWrite};
pub use error::{CoordinationError, Result};
pub use lease::{HolderLiveness, Lease, LeaseManager, LeaseOperation};
pub use permission::{PermissionDecision, PermissionEnforcer, RoleClass, RoleDefinition};
pub use state::{ClockedWrite, LockedNamespace, NamespaceStore, Transform};
pub use storage::Storage;
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry};
