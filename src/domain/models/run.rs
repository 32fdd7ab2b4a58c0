//! Run results and audit record types.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::role::RoleDefinition;

/// Outcome of a single agent invocation, produced by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_tokens: u64,
    pub tool_calls: u32,
    pub duration_ms: u64,
}

impl RunResult {
    /// A successful result with the given output.
    pub fn ok(run_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            output: output.into(),
            success: true,
            error: None,
            tokens_in: 0,
            tokens_out: 0,
            total_tokens: 0,
            tool_calls: 0,
            duration_ms: 0,
        }
    }

    /// A failed result with the given error message.
    pub fn failed(run_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            output: String::new(),
            success: false,
            error: Some(error.into()),
            tokens_in: 0,
            tokens_out: 0,
            total_tokens: 0,
            tool_calls: 0,
            duration_ms: 0,
        }
    }
}

/// Persistent record of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: String,
    pub agent_name: String,
    pub timestamp: String,
    pub user_prompt: String,
    pub model: String,
    pub provider: String,
    pub output: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_tokens: u64,
    pub tool_calls: u32,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub trigger_type: Option<String>,
    pub trigger_metadata: Option<String>,
}

impl AuditRecord {
    /// Build a record from a run result and the role that produced it.
    pub fn from_run(
        result: &RunResult,
        role: &RoleDefinition,
        prompt: &str,
        trigger_type: Option<&str>,
        trigger_metadata: &HashMap<String, String>,
    ) -> Self {
        Self {
            run_id: result.run_id.clone(),
            agent_name: role.metadata.name.clone(),
            timestamp: Utc::now().to_rfc3339(),
            user_prompt: prompt.to_string(),
            model: role.spec.model.name.clone(),
            provider: role.spec.model.provider.clone(),
            output: result.output.clone(),
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
            total_tokens: result.total_tokens,
            tool_calls: result.tool_calls,
            duration_ms: result.duration_ms,
            success: result.success,
            error: result.error.clone(),
            trigger_type: trigger_type.map(str::to_string),
            trigger_metadata: if trigger_metadata.is_empty() {
                None
            } else {
                serde_json::to_string(trigger_metadata).ok()
            },
        }
    }
}

/// Persistent record of a security incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: String,
    pub event_type: String,
    pub agent_name: String,
    pub details: String,
    pub source_ip: Option<String>,
}

impl SecurityEvent {
    pub fn new(
        event_type: impl Into<String>,
        agent_name: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.into(),
            agent_name: agent_name.into(),
            details: details.into(),
            source_ip: None,
        }
    }
}

/// Outcome of one delegate routing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateStatus {
    Delivered,
    Dropped,
    Filtered,
    Error,
    CircuitOpen,
}

impl DelegateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Dropped => "dropped",
            Self::Filtered => "filtered",
            Self::Error => "error",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

/// Persistent record of a delegate routing outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateAuditEvent {
    pub timestamp: String,
    pub source_service: String,
    pub target_service: String,
    pub status: String,
    pub source_run_id: String,
    pub reason: Option<String>,
    pub trace: Option<String>,
    pub payload_preview: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::role::RoleDefinition;

    fn role() -> RoleDefinition {
        RoleDefinition::from_yaml(
            "apiVersion: initrunner/v1\nkind: Role\nmetadata:\n  name: worker\nspec:\n  model:\n    provider: anthropic\n    name: claude-sonnet-4-5\n",
        )
        .unwrap()
    }

    #[test]
    fn test_record_from_run() {
        let result = RunResult::ok("run-1", "done");
        let record = AuditRecord::from_run(&result, &role(), "go", Some("cron"), &HashMap::new());
        assert_eq!(record.agent_name, "worker");
        assert_eq!(record.model, "claude-sonnet-4-5");
        assert_eq!(record.trigger_type.as_deref(), Some("cron"));
        assert!(record.trigger_metadata.is_none());
        assert!(record.success);
    }

    #[test]
    fn test_record_serializes_metadata() {
        let result = RunResult::failed("run-2", "boom");
        let mut metadata = HashMap::new();
        metadata.insert("path".to_string(), "/tmp/x".to_string());
        let record = AuditRecord::from_run(&result, &role(), "go", Some("file-watch"), &metadata);
        let parsed: serde_json::Value =
            serde_json::from_str(record.trigger_metadata.as_deref().unwrap()).unwrap();
        assert_eq!(parsed["path"], "/tmp/x");
        assert!(!record.success);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(DelegateStatus::Delivered.as_str(), "delivered");
        assert_eq!(DelegateStatus::CircuitOpen.as_str(), "circuit_open");
    }
}
