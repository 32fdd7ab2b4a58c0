//! Append-only audit trail: run records, security events, delegate routing.

pub mod export;
pub mod logger;
pub mod redact;

pub use logger::{AuditConfig, AuditError, AuditLogger, DelegateQuery, RunQuery, SecurityQuery};
pub use redact::scrub_secrets;
