//! Ports: trait boundaries to external collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::role::{RoleDefinition, TriggerConfig};
use crate::domain::models::run::RunResult;
use crate::sinks::SinkPayload;
use crate::triggers::TriggerDispatcher;

/// Executes one agent run. The LLM invocation itself is outside the
/// orchestrator core; implementations must encapsulate their own failures
/// in the returned [`RunResult`] rather than panicking.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        role: &RoleDefinition,
        prompt: &str,
        trigger_type: Option<&str>,
        trigger_metadata: &HashMap<String, String>,
    ) -> RunResult;
}

/// Error returned by a sink delivery attempt.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// A destination for run results. The dispatcher isolates sink faults:
/// a non-OK outcome is logged, never propagated.
#[async_trait]
pub trait RunSink: Send + Sync {
    /// Short name used in fault logs.
    fn name(&self) -> &str;

    async fn send(&self, payload: &SinkPayload) -> Result<(), SinkError>;
}

/// Builds trigger dispatchers for services. Injected into the orchestrator
/// so trigger implementations stay pluggable.
pub trait TriggerDispatcherFactory: Send + Sync {
    fn build(&self, triggers: &[TriggerConfig]) -> Arc<TriggerDispatcher>;
}
