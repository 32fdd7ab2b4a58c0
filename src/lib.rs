//! InitRunner - declarative multi-agent runtime and compose orchestrator.
//!
//! Runs a graph of LLM-agent services defined in a compose YAML file:
//! - Inter-service delegation over bounded inboxes with backpressure
//!   and per-edge circuit breaking
//! - Cron / file-watch / webhook triggers fanned into per-service inboxes
//! - Restart supervision with retry ceilings
//! - Append-only SQLite audit trail with secret scrubbing
//! - Cooperative per-thread sandbox around untrusted tool code

pub mod audit;
pub mod cli;
pub mod domain;
pub mod executor;
pub mod infrastructure;
pub mod sandbox;
pub mod services;
pub mod sinks;
pub mod tools;
pub mod triggers;

// Re-export the types most callers need.
pub use audit::logger::AuditLogger;
pub use domain::models::compose::ComposeDefinition;
pub use services::orchestrator::ComposeOrchestrator;
