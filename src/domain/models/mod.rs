//! Domain models.

pub mod compose;
pub mod delegate;
pub mod role;
pub mod run;

pub use compose::{
    ComposeDefinition, ComposeError, ComposeMetadata, ComposeSpec, DelegateSinkConfig,
    RestartCondition, RestartPolicy, ServiceConfig, SharedMemoryConfig,
};
pub use delegate::DelegateEvent;
pub use role::{
    MemoryConfig, ModelConfig, RoleDefinition, RoleError, SecurityPolicy, SinkConfig,
    ToolSandboxConfig, ToolsetConfig, TriggerConfig, ViolationAction,
};
pub use run::{AuditRecord, DelegateAuditEvent, DelegateStatus, RunResult, SecurityEvent};
