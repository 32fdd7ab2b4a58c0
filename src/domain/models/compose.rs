//! Compose definition models and load-time validation.
//!
//! A compose file declares a set of agent services, the delegation edges
//! between them, restart policies, and optional shared memory. Validation
//! happens once at load time; runtime code can assume a well-formed graph.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::graph::{find_cycle, topological_tiers};

/// Errors raised while loading or validating a compose definition.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("failed to read compose file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse compose YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported kind '{0}', expected 'Compose'")]
    InvalidKind(String),

    #[error("compose must declare at least one service")]
    NoServices,

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownService { service: String, dependency: String },

    #[error("service '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("service '{service}' delegates to unknown service '{target}'")]
    UnknownDelegateTarget { service: String, target: String },

    #[error("service '{0}' cannot delegate to itself")]
    SelfDelegate(String),

    #[error("dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("delegate cycle detected: {0}")]
    DelegateCycle(String),

    #[error("all services failed to build: {0}")]
    AllServicesFailed(String),
}

/// Restart condition for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartCondition {
    /// Never restart.
    #[default]
    None,
    /// Restart only when the service has recorded execution errors.
    OnFailure,
    /// Restart whenever the service is not running.
    Always,
}

impl RestartCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::OnFailure => "on-failure",
            Self::Always => "always",
        }
    }
}

/// Restart policy applied by the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub condition: RestartCondition,
    pub max_retries: u32,
    pub delay_seconds: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            condition: RestartCondition::None,
            max_retries: 3,
            delay_seconds: 5,
        }
    }
}

/// One or many delegate targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelegateTarget {
    One(String),
    Many(Vec<String>),
}

impl DelegateTarget {
    /// Targets as a list regardless of declaration form.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Self::One(name) => vec![name.clone()],
            Self::Many(names) => names.clone(),
        }
    }
}

fn default_sink_type() -> String {
    "delegate".to_string()
}

fn default_queue_size() -> usize {
    100
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_reset_seconds() -> u64 {
    60
}

/// Delegate sink configuration for a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateSinkConfig {
    #[serde(rename = "type", default = "default_sink_type")]
    pub sink_type: String,
    pub target: DelegateTarget,
    #[serde(default)]
    pub keep_existing_sinks: bool,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Consecutive failures before the circuit opens. `None` disables the breaker.
    #[serde(default)]
    pub circuit_breaker_threshold: Option<u32>,
    #[serde(default = "default_reset_seconds")]
    pub circuit_breaker_reset_seconds: u64,
}

impl DelegateSinkConfig {
    /// One-line description for status tables.
    pub fn summary(&self) -> String {
        format!("delegate: {}", self.target.as_list().join(", "))
    }
}

/// Per-service configuration within a compose definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub role: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub sink: Option<DelegateSinkConfig>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_max_memories() -> usize {
    1000
}

/// Shared memory settings applied across all services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedMemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub store_path: Option<String>,
    #[serde(default = "default_max_memories")]
    pub max_memories: usize,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store_path: None,
            max_memories: default_max_memories(),
        }
    }
}

/// Compose metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Compose spec block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeSpec {
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub shared_memory: SharedMemoryConfig,
}

/// A full compose definition as parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeDefinition {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ComposeMetadata,
    pub spec: ComposeSpec,
}

impl ComposeDefinition {
    /// Read, parse, and validate a compose YAML file.
    pub fn from_path(path: &Path) -> Result<Self, ComposeError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse and validate compose YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ComposeError> {
        let compose: Self = serde_yaml::from_str(text)?;
        compose.validate()?;
        Ok(compose)
    }

    /// Validate graph invariants: references, self edges, cycles.
    pub fn validate(&self) -> Result<(), ComposeError> {
        if self.kind != "Compose" {
            return Err(ComposeError::InvalidKind(self.kind.clone()));
        }
        if self.spec.services.is_empty() {
            return Err(ComposeError::NoServices);
        }

        let names: BTreeSet<String> = self.spec.services.keys().cloned().collect();

        for (name, svc) in &self.spec.services {
            for dep in &svc.depends_on {
                if !names.contains(dep) {
                    return Err(ComposeError::UnknownService {
                        service: name.clone(),
                        dependency: dep.clone(),
                    });
                }
                if dep == name {
                    return Err(ComposeError::SelfDependency(name.clone()));
                }
            }
            if let Some(sink) = &svc.sink {
                for target in sink.target.as_list() {
                    if !names.contains(&target) {
                        return Err(ComposeError::UnknownDelegateTarget {
                            service: name.clone(),
                            target,
                        });
                    }
                    if target == *name {
                        return Err(ComposeError::SelfDelegate(name.clone()));
                    }
                }
            }
        }

        // Dependency cycle check via the same tiering used at startup.
        let depends_on: BTreeMap<String, Vec<String>> = self
            .spec
            .services
            .iter()
            .map(|(name, svc)| (name.clone(), svc.depends_on.clone()))
            .collect();
        if topological_tiers(&names, &depends_on).is_err() {
            let path = find_cycle(&names, &depends_on).unwrap_or_default();
            return Err(ComposeError::DependencyCycle(path.join(" -> ")));
        }

        // Delegate cycle check on the forward routing edges, so the error
        // reports the cycle in the direction messages actually flow.
        let delegate_edges: BTreeMap<String, Vec<String>> = self
            .spec
            .services
            .iter()
            .map(|(name, svc)| {
                let targets = svc.sink.as_ref().map(|s| s.target.as_list()).unwrap_or_default();
                (name.clone(), targets)
            })
            .collect();
        if let Some(path) = find_cycle(&names, &delegate_edges) {
            return Err(ComposeError::DelegateCycle(path.join(" -> ")));
        }

        Ok(())
    }

    /// Startup tiers over the given subset of services (dependencies outside
    /// the subset are ignored, matching partial-build survival).
    pub fn tiers_for(&self, surviving: &BTreeSet<String>) -> Vec<Vec<String>> {
        let edges: BTreeMap<String, Vec<String>> = self
            .spec
            .services
            .iter()
            .filter(|(name, _)| surviving.contains(*name))
            .map(|(name, svc)| {
                let deps = svc
                    .depends_on
                    .iter()
                    .filter(|dep| surviving.contains(*dep))
                    .cloned()
                    .collect();
                (name.clone(), deps)
            })
            .collect();
        // Validation already rejected cycles.
        topological_tiers(surviving, &edges).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_compose(services_yaml: &str) -> String {
        format!(
            "apiVersion: initrunner/v1\nkind: Compose\nmetadata:\n  name: test\nspec:\n  services:\n{services_yaml}"
        )
    }

    #[test]
    fn test_parse_minimal() {
        let yaml = minimal_compose("    worker:\n      role: worker.yaml\n");
        let compose = ComposeDefinition::from_yaml(&yaml).unwrap();
        assert_eq!(compose.metadata.name, "test");
        assert_eq!(compose.spec.services.len(), 1);
        let svc = &compose.spec.services["worker"];
        assert!(svc.sink.is_none());
        assert_eq!(svc.restart.condition, RestartCondition::None);
        assert_eq!(svc.restart.max_retries, 3);
    }

    #[test]
    fn test_sink_defaults() {
        let yaml = minimal_compose(
            "    a:\n      role: a.yaml\n      sink:\n        type: delegate\n        target: b\n    b:\n      role: b.yaml\n",
        );
        let compose = ComposeDefinition::from_yaml(&yaml).unwrap();
        let sink = compose.spec.services["a"].sink.as_ref().unwrap();
        assert_eq!(sink.queue_size, 100);
        assert_eq!(sink.timeout_seconds, 60);
        assert_eq!(sink.circuit_breaker_threshold, None);
        assert_eq!(sink.circuit_breaker_reset_seconds, 60);
        assert!(!sink.keep_existing_sinks);
        assert_eq!(sink.target.as_list(), vec!["b"]);
    }

    #[test]
    fn test_multi_target_sink() {
        let yaml = minimal_compose(
            "    a:\n      role: a.yaml\n      sink:\n        target: [b, c]\n    b:\n      role: b.yaml\n    c:\n      role: c.yaml\n",
        );
        let compose = ComposeDefinition::from_yaml(&yaml).unwrap();
        let sink = compose.spec.services["a"].sink.as_ref().unwrap();
        assert_eq!(sink.target.as_list(), vec!["b", "c"]);
        assert_eq!(sink.summary(), "delegate: b, c");
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let yaml = minimal_compose("    a:\n      role: a.yaml\n      depends_on: [ghost]\n");
        let err = ComposeDefinition::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ComposeError::UnknownService { .. }));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let yaml = minimal_compose("    a:\n      role: a.yaml\n      depends_on: [a]\n");
        let err = ComposeDefinition::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ComposeError::SelfDependency(_)));
    }

    #[test]
    fn test_self_delegate_rejected() {
        let yaml = minimal_compose("    a:\n      role: a.yaml\n      sink:\n        target: a\n");
        let err = ComposeDefinition::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ComposeError::SelfDelegate(_)));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let yaml = minimal_compose(
            "    a:\n      role: a.yaml\n      depends_on: [b]\n    b:\n      role: b.yaml\n      depends_on: [a]\n",
        );
        let err = ComposeDefinition::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn test_delegate_cycle_rejected() {
        let yaml = minimal_compose(
            "    a:\n      role: a.yaml\n      sink:\n        target: b\n    b:\n      role: b.yaml\n      sink:\n        target: a\n",
        );
        let err = ComposeDefinition::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("delegate cycle"));
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let yaml = "apiVersion: initrunner/v1\nkind: Role\nmetadata:\n  name: x\nspec:\n  services:\n    a:\n      role: a.yaml\n";
        let err = ComposeDefinition::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ComposeError::InvalidKind(_)));
    }

    #[test]
    fn test_tiers_follow_dependencies() {
        let yaml = minimal_compose(
            "    a:\n      role: a.yaml\n    b:\n      role: b.yaml\n      depends_on: [a]\n    c:\n      role: c.yaml\n      depends_on: [a]\n",
        );
        let compose = ComposeDefinition::from_yaml(&yaml).unwrap();
        let all: BTreeSet<String> = compose.spec.services.keys().cloned().collect();
        let tiers = compose.tiers_for(&all);
        assert_eq!(tiers, vec![vec!["a".to_string()], vec!["b".to_string(), "c".to_string()]]);
    }

    #[test]
    fn test_tiers_ignore_missing_services() {
        let yaml = minimal_compose(
            "    a:\n      role: a.yaml\n    b:\n      role: b.yaml\n      depends_on: [a]\n",
        );
        let compose = ComposeDefinition::from_yaml(&yaml).unwrap();
        let surviving: BTreeSet<String> = ["b".to_string()].into_iter().collect();
        let tiers = compose.tiers_for(&surviving);
        assert_eq!(tiers, vec![vec!["b".to_string()]]);
    }
}
