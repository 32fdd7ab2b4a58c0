//! Runtime settings with hierarchical merging.
//!
//! Precedence (lowest to highest): programmatic defaults, the project-local
//! `.initrunner/config.yaml`, then `INITRUNNER_`-prefixed environment
//! variables. Compose and role files are separate wire formats and are not
//! loaded through here.

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings validation errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid log level '{0}', expected one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format '{0}', expected one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("audit database path cannot be empty")]
    EmptyAuditDbPath,

    #[error("executor command cannot be empty")]
    EmptyExecutorCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub db_path: String,
    pub retention_days: i64,
    pub max_records: i64,
    pub auto_prune_interval: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            db_path: ".initrunner/audit.db".to_string(),
            retention_days: 90,
            max_records: 100_000,
            auto_prune_interval: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub dir: String,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            dir: ".initrunner/memory".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
        }
    }
}

/// Top-level runtime settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub audit: AuditSettings,
    pub logging: LoggingSettings,
    pub memory: MemorySettings,
    pub executor: ExecutorSettings,
}

impl Settings {
    /// Load settings from defaults, project config, and environment.
    pub fn load() -> Result<Self, SettingsError> {
        let settings: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file(".initrunner/config.yaml"))
            .merge(Env::prefixed("INITRUNNER_").split("__"))
            .extract()
            .map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from a specific file (plus defaults), skipping the environment.
    pub fn load_from(path: &std::path::Path) -> Result<Self, SettingsError> {
        let settings: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path))
            .extract()
            .map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.logging.level.as_str()) {
            return Err(SettingsError::InvalidLogLevel(self.logging.level.clone()));
        }
        const FORMATS: [&str; 2] = ["json", "pretty"];
        if !FORMATS.contains(&self.logging.format.as_str()) {
            return Err(SettingsError::InvalidLogFormat(self.logging.format.clone()));
        }
        if self.audit.db_path.is_empty() {
            return Err(SettingsError::EmptyAuditDbPath);
        }
        if self.executor.command.is_empty() {
            return Err(SettingsError::EmptyExecutorCommand);
        }
        Ok(())
    }
}
