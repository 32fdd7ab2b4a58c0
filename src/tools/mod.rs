//! Toolset registry.
//!
//! Tool implementations live outside the orchestrator core. Each toolset
//! registers a `(type name, builder)` pair at startup; roles reference
//! toolsets by type name and the builder receives the raw config block.

use std::collections::BTreeMap;
use std::sync::{OnceLock, RwLock};

use thiserror::Error;

use crate::domain::models::role::ToolsetConfig;

/// Errors from building a toolset.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown toolset type '{0}'")]
    UnknownType(String),

    #[error("invalid config for toolset '{toolset}': {message}")]
    InvalidConfig { toolset: String, message: String },
}

/// A built toolset handed to the executor.
pub trait Toolset: Send + Sync {
    /// The registered type name.
    fn type_name(&self) -> &'static str;

    /// Names of the individual tools this set exposes.
    fn tool_names(&self) -> Vec<String>;
}

/// Builder function registered per toolset type.
pub type ToolsetBuilder = fn(&serde_yaml::Value) -> Result<Box<dyn Toolset>, ToolError>;

fn registry() -> &'static RwLock<BTreeMap<String, ToolsetBuilder>> {
    static REGISTRY: OnceLock<RwLock<BTreeMap<String, ToolsetBuilder>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(BTreeMap::new()))
}

/// Register a builder for `type_name`. Later registrations win, so tests
/// and embedders can override built-ins.
pub fn register_toolset(type_name: &str, builder: ToolsetBuilder) {
    registry()
        .write()
        .expect("toolset registry lock")
        .insert(type_name.to_string(), builder);
}

/// Registered type names, sorted.
pub fn registered_types() -> Vec<String> {
    registry()
        .read()
        .expect("toolset registry lock")
        .keys()
        .cloned()
        .collect()
}

/// Build a toolset from its role config block.
pub fn build_toolset(config: &ToolsetConfig) -> Result<Box<dyn Toolset>, ToolError> {
    let builder = {
        let registry = registry().read().expect("toolset registry lock");
        registry.get(&config.toolset_type).copied()
    };
    match builder {
        Some(builder) => builder(&config.config),
        None => Err(ToolError::UnknownType(config.toolset_type.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoToolset;

    impl Toolset for EchoToolset {
        fn type_name(&self) -> &'static str {
            "echo"
        }

        fn tool_names(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }
    }

    fn build_echo(_config: &serde_yaml::Value) -> Result<Box<dyn Toolset>, ToolError> {
        Ok(Box::new(EchoToolset))
    }

    #[test]
    fn test_register_and_build() {
        register_toolset("echo", build_echo);
        assert!(registered_types().contains(&"echo".to_string()));

        let config = ToolsetConfig {
            toolset_type: "echo".to_string(),
            config: serde_yaml::Value::Null,
        };
        let toolset = build_toolset(&config).unwrap();
        assert_eq!(toolset.type_name(), "echo");
        assert_eq!(toolset.tool_names(), vec!["echo"]);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let config = ToolsetConfig {
            toolset_type: "does-not-exist".to_string(),
            config: serde_yaml::Value::Null,
        };
        assert!(matches!(build_toolset(&config), Err(ToolError::UnknownType(_))));
    }
}
