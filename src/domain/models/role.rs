//! Role definition models.
//!
//! A role file describes a single agent: its model, prompt, toolsets,
//! triggers, sinks, memory, and security policy. The orchestrator consumes
//! roles as-is; the only field it ever mutates is the memory store location
//! when compose-level shared memory is enabled.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a role file.
#[derive(Debug, Error)]
pub enum RoleError {
    #[error("failed to read role file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse role YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported kind '{0}', expected 'Role'")]
    InvalidKind(String),
}

/// Model selection for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_memory_max() -> usize {
    1000
}

fn default_max_sessions() -> usize {
    20
}

/// Persistent memory settings for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub store_path: Option<String>,
    #[serde(default = "default_memory_max")]
    pub max_memories: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            max_memories: default_memory_max(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// A toolset reference: a registered type name plus its raw config.
///
/// Tool implementations live outside the orchestrator core; builders are
/// looked up in the toolset registry by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsetConfig {
    #[serde(rename = "type")]
    pub toolset_type: String,
    #[serde(flatten)]
    pub config: serde_yaml::Value,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_debounce_seconds() -> u64 {
    2
}

fn default_watch_prompt() -> String {
    "File changed: {path}".to_string()
}

fn default_webhook_path() -> String {
    "/hook".to_string()
}

fn default_rate_limit_rpm() -> u32 {
    60
}

/// Trigger declarations within a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TriggerConfig {
    /// Fire at scheduled wall-clock times.
    Cron {
        schedule: String,
        #[serde(default = "default_timezone")]
        timezone: String,
        prompt: String,
    },
    /// Fire when watched files change.
    FileWatch {
        paths: Vec<String>,
        #[serde(default)]
        extensions: Vec<String>,
        #[serde(default = "default_debounce_seconds")]
        debounce_seconds: u64,
        #[serde(default = "default_watch_prompt")]
        prompt_template: String,
    },
    /// Fire on authenticated HTTP requests.
    Webhook {
        port: u16,
        #[serde(default = "default_webhook_path")]
        path: String,
        secret: String,
        #[serde(default = "default_rate_limit_rpm")]
        rate_limit_rpm: u32,
    },
}

fn default_file_format() -> String {
    "json".to_string()
}

fn default_http_method() -> String {
    "POST".to_string()
}

fn default_webhook_timeout() -> u64 {
    30
}

/// Role-level sink declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SinkConfig {
    /// Append run results to a local file.
    File {
        path: String,
        #[serde(default = "default_file_format")]
        format: String,
    },
    /// POST run results to a URL.
    Webhook {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default = "default_webhook_timeout")]
        timeout_seconds: u64,
        #[serde(default)]
        retry_count: u32,
    },
}

/// What to do when sandboxed tool code violates policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ViolationAction {
    /// Fail the tool call immediately.
    #[default]
    Raise,
    /// Record the violation and continue.
    Log,
}

fn default_blocked_modules() -> Vec<String> {
    [
        "os",
        "subprocess",
        "shutil",
        "sys",
        "importlib",
        "ctypes",
        "socket",
        "http.server",
        "pickle",
        "shelve",
        "marshal",
        "code",
        "codeop",
        "threading",
        "_thread",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

/// Sandbox policy for custom tool code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSandboxConfig {
    /// Master switch for runtime sandbox enforcement.
    #[serde(default)]
    pub audit_hooks_enabled: bool,
    #[serde(default)]
    pub allowed_custom_modules: Vec<String>,
    #[serde(default = "default_blocked_modules")]
    pub blocked_custom_modules: Vec<String>,
    /// Paths tool code may write under. Empty means all writes are denied.
    #[serde(default)]
    pub allowed_write_paths: Vec<String>,
    /// Hostname allowlist for DNS resolution. Empty means any host.
    #[serde(default)]
    pub allowed_network_hosts: Vec<String>,
    #[serde(default = "default_true")]
    pub block_private_ips: bool,
    #[serde(default)]
    pub allow_subprocess: bool,
    #[serde(default)]
    pub allow_eval_exec: bool,
    #[serde(default)]
    pub sandbox_violation_action: ViolationAction,
}

impl Default for ToolSandboxConfig {
    fn default() -> Self {
        Self {
            audit_hooks_enabled: false,
            allowed_custom_modules: Vec::new(),
            blocked_custom_modules: default_blocked_modules(),
            allowed_write_paths: Vec::new(),
            allowed_network_hosts: Vec::new(),
            block_private_ips: true,
            allow_subprocess: false,
            allow_eval_exec: false,
            sandbox_violation_action: ViolationAction::Raise,
        }
    }
}

/// Role security policy. Only the tool sandbox block is consumed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub tools: ToolSandboxConfig,
}

/// Role metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Role spec block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub model: ModelConfig,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<ToolsetConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub memory: Option<MemoryConfig>,
    #[serde(default)]
    pub security: SecurityPolicy,
}

/// A full role definition as parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDefinition {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: RoleMetadata,
    pub spec: RoleSpec,
}

impl RoleDefinition {
    /// Read and parse a role YAML file.
    pub fn from_path(path: &Path) -> Result<Self, RoleError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse role YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, RoleError> {
        let role: Self = serde_yaml::from_str(text)?;
        if role.kind != "Role" {
            return Err(RoleError::InvalidKind(role.kind));
        }
        Ok(role)
    }

    /// Point this role's memory at a shared store, overriding path and cap.
    /// Injects a memory config if the role has none.
    pub fn apply_shared_memory(&mut self, store_path: &str, max_memories: usize) {
        match &mut self.spec.memory {
            Some(memory) => {
                memory.store_path = Some(store_path.to_string());
                memory.max_memories = max_memories;
            }
            None => {
                self.spec.memory = Some(MemoryConfig {
                    store_path: Some(store_path.to_string()),
                    max_memories,
                    ..MemoryConfig::default()
                });
            }
        }
    }
}
