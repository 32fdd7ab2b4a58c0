//! Agent executor adapters.
//!
//! The LLM invocation itself is outside the orchestrator core; these
//! adapters implement the [`AgentExecutor`] port. [`CommandExecutor`] shells
//! out to a provider CLI; [`MockExecutor`] scripts deterministic responses
//! for tests.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::domain::models::role::RoleDefinition;
use crate::domain::models::run::RunResult;
use crate::domain::ports::AgentExecutor;

/// Runs each prompt through an external provider command. The role's system
/// prompt is prepended; the combined prompt is written to stdin and stdout
/// becomes the run output.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn execute(
        &self,
        role: &RoleDefinition,
        prompt: &str,
        trigger_type: Option<&str>,
        _trigger_metadata: &HashMap<String, String>,
    ) -> RunResult {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        debug!(
            "[{}] executing run {run_id} (trigger: {})",
            role.metadata.name,
            trigger_type.unwrap_or("manual")
        );

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env("INITRUNNER_AGENT", &role.metadata.name)
            .env("INITRUNNER_MODEL", &role.spec.model.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut result = RunResult::failed(run_id, format!("failed to spawn {}: {e}", self.program));
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        let full_prompt = if role.spec.system_prompt.is_empty() {
            prompt.to_string()
        } else {
            format!("{}\n\n{prompt}", role.spec.system_prompt)
        };
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(full_prompt.as_bytes()).await;
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                let mut result = RunResult::failed(run_id, format!("executor failed: {e}"));
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if output.status.success() {
            let mut result = RunResult::ok(run_id, stdout);
            result.duration_ms = duration_ms;
            result
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            let mut result = RunResult::failed(
                run_id,
                format!("{} exited with {}: {stderr}", self.program, output.status),
            );
            result.output = stdout;
            result.duration_ms = duration_ms;
            result
        }
    }
}

/// One recorded executor invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub agent_name: String,
    pub prompt: String,
    pub trigger_type: Option<String>,
    pub trigger_metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
enum MockResponse {
    Ok(String),
    Fail(String),
}

/// Scripted executor for tests. Responses are keyed by agent name; agents
/// without a script echo their prompt back.
#[derive(Default)]
pub struct MockExecutor {
    responses: Mutex<HashMap<String, MockResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful output for an agent.
    pub async fn respond_with(&self, agent_name: &str, output: &str) {
        self.responses
            .lock()
            .await
            .insert(agent_name.to_string(), MockResponse::Ok(output.to_string()));
    }

    /// Script a failure for an agent.
    pub async fn fail_with(&self, agent_name: &str, error: &str) {
        self.responses
            .lock()
            .await
            .insert(agent_name.to_string(), MockResponse::Fail(error.to_string()));
    }

    /// Every invocation seen so far, in order.
    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    /// Invocations for one agent.
    pub async fn calls_for(&self, agent_name: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.agent_name == agent_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    async fn execute(
        &self,
        role: &RoleDefinition,
        prompt: &str,
        trigger_type: Option<&str>,
        trigger_metadata: &HashMap<String, String>,
    ) -> RunResult {
        self.calls.lock().await.push(RecordedCall {
            agent_name: role.metadata.name.clone(),
            prompt: prompt.to_string(),
            trigger_type: trigger_type.map(str::to_string),
            trigger_metadata: trigger_metadata.clone(),
        });

        let run_id = Uuid::new_v4().to_string();
        match self.responses.lock().await.get(&role.metadata.name) {
            Some(MockResponse::Ok(output)) => RunResult::ok(run_id, output.clone()),
            Some(MockResponse::Fail(error)) => RunResult::failed(run_id, error.clone()),
            None => RunResult::ok(run_id, prompt),
        }
    }
}

/// Convenience: a shared mock.
pub fn mock_executor() -> Arc<MockExecutor> {
    Arc::new(MockExecutor::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str) -> RoleDefinition {
        RoleDefinition::from_yaml(&format!(
            "apiVersion: initrunner/v1\nkind: Role\nmetadata:\n  name: {name}\nspec:\n  model:\n    provider: anthropic\n    name: claude-sonnet-4-5\n"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_mock_echoes_without_script() {
        let executor = MockExecutor::new();
        let result = executor.execute(&role("a"), "hello", None, &HashMap::new()).await;
        assert!(result.success);
        assert_eq!(result.output, "hello");
    }

    #[tokio::test]
    async fn test_mock_scripted_failure() {
        let executor = MockExecutor::new();
        executor.fail_with("a", "nope").await;
        let result = executor.execute(&role("a"), "hello", None, &HashMap::new()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_command_executor_runs_cat() {
        let executor = CommandExecutor::new("cat", vec![]);
        let result = executor.execute(&role("a"), "pass through", None, &HashMap::new()).await;
        assert!(result.success);
        assert_eq!(result.output, "pass through");
    }

    #[tokio::test]
    async fn test_command_executor_missing_program() {
        let executor = CommandExecutor::new("definitely-not-a-real-binary", vec![]);
        let result = executor.execute(&role("a"), "x", None, &HashMap::new()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("failed to spawn"));
    }
}
