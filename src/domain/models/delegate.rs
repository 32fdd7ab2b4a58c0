//! Inter-service delegate events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key carrying the comma-joined service trace.
pub const TRACE_KEY: &str = "_compose_trace";

/// Metadata key preserving the first externally-injected prompt across hops.
pub const ORIGINAL_PROMPT_KEY: &str = "_compose_original_prompt";

/// Metadata key carrying the upstream service's output.
pub const SOURCE_OUTPUT_KEY: &str = "_compose_source_output";

/// Maximum number of services an event may transit before it is dropped.
pub const MAX_DELEGATION_DEPTH: usize = 20;

/// Message passed between compose services via inbox queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateEvent {
    pub source_service: String,
    pub target_service: String,
    pub prompt: String,
    pub source_run_id: String,
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub trace: Vec<String>,
}

impl DelegateEvent {
    pub fn new(
        source_service: impl Into<String>,
        target_service: impl Into<String>,
        prompt: impl Into<String>,
        source_run_id: impl Into<String>,
    ) -> Self {
        Self {
            source_service: source_service.into(),
            target_service: target_service.into(),
            prompt: prompt.into(),
            source_run_id: source_run_id.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            trace: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }
}

/// Parse a comma-joined trace string into its service hops.
pub fn parse_trace(trace: &str) -> Vec<String> {
    if trace.is_empty() {
        return Vec::new();
    }
    trace.split(',').map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trace_empty() {
        assert!(parse_trace("").is_empty());
    }

    #[test]
    fn test_parse_trace_chain() {
        assert_eq!(parse_trace("a,b,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_event_builder() {
        let event = DelegateEvent::new("a", "b", "do it", "run-1")
            .with_trace(vec!["a".to_string()]);
        assert_eq!(event.source_service, "a");
        assert_eq!(event.trace, vec!["a"]);
        assert!(event.metadata.is_empty());
    }
}
