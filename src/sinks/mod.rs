//! Run result sinks and the per-service dispatcher.

pub mod file;
pub mod webhook;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::domain::models::role::{RoleDefinition, SinkConfig};
use crate::domain::models::run::RunResult;
use crate::domain::ports::RunSink;

pub use file::FileSink;
pub use webhook::WebhookSink;

/// Everything a sink needs about one completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkPayload {
    pub agent_name: String,
    pub run_id: String,
    pub prompt: String,
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
    pub model: String,
    pub provider: String,
    pub trigger_type: Option<String>,
    pub trigger_metadata: HashMap<String, String>,
    pub timestamp: String,
}

impl SinkPayload {
    /// Build a payload from a run result and the role that produced it.
    pub fn from_run(
        result: &RunResult,
        role: &RoleDefinition,
        prompt: &str,
        trigger_type: Option<&str>,
        trigger_metadata: &HashMap<String, String>,
    ) -> Self {
        Self {
            agent_name: role.metadata.name.clone(),
            run_id: result.run_id.clone(),
            prompt: prompt.to_string(),
            output: result.output.clone(),
            success: result.success,
            error: result.error.clone(),
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
            duration_ms: result.duration_ms,
            model: role.spec.model.name.clone(),
            provider: role.spec.model.provider.clone(),
            trigger_type: trigger_type.map(str::to_string),
            trigger_metadata: trigger_metadata.clone(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Build a role-level sink instance from its config.
pub fn build_sink(config: &SinkConfig, role_dir: &Path) -> Arc<dyn RunSink> {
    match config {
        SinkConfig::File { path, format } => {
            let resolved = if Path::new(path).is_absolute() {
                path.clone().into()
            } else {
                role_dir.join(path)
            };
            Arc::new(FileSink::new(resolved, format))
        }
        SinkConfig::Webhook {
            url,
            method,
            headers,
            timeout_seconds,
            retry_count,
        } => Arc::new(WebhookSink::new(
            url.clone(),
            method.clone(),
            headers.clone(),
            *timeout_seconds,
            *retry_count,
        )),
    }
}

/// Fans one run result out to every configured sink, isolating faults:
/// a failing sink is logged and never affects its siblings or the caller.
pub struct SinkDispatcher {
    role: RoleDefinition,
    sinks: Mutex<Vec<Arc<dyn RunSink>>>,
}

impl SinkDispatcher {
    pub fn new(role: RoleDefinition) -> Self {
        Self {
            role,
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Register an externally-constructed sink (e.g. a delegate sink).
    pub fn add_sink(&self, sink: Arc<dyn RunSink>) {
        self.sinks.lock().expect("sink list lock").push(sink);
    }

    pub fn count(&self) -> usize {
        self.sinks.lock().expect("sink list lock").len()
    }

    /// Deliver the result to all sinks.
    pub async fn dispatch(
        &self,
        result: &RunResult,
        prompt: &str,
        trigger_type: Option<&str>,
        trigger_metadata: &HashMap<String, String>,
    ) {
        let payload =
            SinkPayload::from_run(result, &self.role, prompt, trigger_type, trigger_metadata);
        let sinks: Vec<Arc<dyn RunSink>> =
            self.sinks.lock().expect("sink list lock").clone();
        for sink in sinks {
            if let Err(e) = sink.send(&payload).await {
                error!("sink {} failed: {e}", sink.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::SinkError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn role() -> RoleDefinition {
        RoleDefinition::from_yaml(
            "apiVersion: initrunner/v1\nkind: Role\nmetadata:\n  name: worker\nspec:\n  model:\n    provider: anthropic\n    name: claude-sonnet-4-5\n",
        )
        .unwrap()
    }

    struct CountingSink {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl RunSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send(&self, _payload: &SinkPayload) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SinkError::Other("boom".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_all_sinks() {
        let dispatcher = SinkDispatcher::new(role());
        let ok = Arc::new(CountingSink { calls: AtomicU32::new(0), fail: false });
        let failing = Arc::new(CountingSink { calls: AtomicU32::new(0), fail: true });
        dispatcher.add_sink(failing.clone());
        dispatcher.add_sink(ok.clone());

        let result = RunResult::ok("run-1", "out");
        dispatcher.dispatch(&result, "go", None, &HashMap::new()).await;

        // The failing sink is isolated; the second sink still ran.
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_payload_from_run() {
        let result = RunResult::failed("run-2", "bad");
        let payload = SinkPayload::from_run(&result, &role(), "go", Some("webhook"), &HashMap::new());
        assert_eq!(payload.agent_name, "worker");
        assert_eq!(payload.trigger_type.as_deref(), Some("webhook"));
        assert!(!payload.success);
    }
}
