//! Triggers: external event sources fanned into a single service callback.

pub mod cron;
pub mod file_watch;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{error, info};

use crate::domain::models::role::TriggerConfig;
use crate::domain::ports::TriggerDispatcherFactory;

pub use cron::CronTrigger;
pub use file_watch::FileWatchTrigger;
pub use webhook::WebhookTrigger;

/// An event emitted by a trigger.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub trigger_type: String,
    pub prompt: String,
    pub metadata: HashMap<String, String>,
}

impl TriggerEvent {
    pub fn new(trigger_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            trigger_type: trigger_type.into(),
            prompt: prompt.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Callback invoked for every trigger event.
pub type TriggerCallback = Arc<dyn Fn(TriggerEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Errors raised while starting a trigger.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid cron schedule '{schedule}': {message}")]
    InvalidSchedule { schedule: String, message: String },

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("failed to watch path: {0}")]
    Watch(String),

    #[error("failed to bind webhook listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// One runnable trigger. Implementations own their background task and
/// stop cooperatively.
#[async_trait]
pub trait Trigger: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn start(&self, callback: TriggerCallback) -> Result<(), TriggerError>;

    async fn stop(&self);
}

/// Aggregates a role's triggers behind start/stop-all.
pub struct TriggerDispatcher {
    triggers: Vec<Arc<dyn Trigger>>,
}

impl TriggerDispatcher {
    pub fn new(triggers: Vec<Arc<dyn Trigger>>) -> Self {
        Self { triggers }
    }

    pub fn count(&self) -> usize {
        self.triggers.len()
    }

    /// Start every trigger. A trigger that fails to start is logged and
    /// skipped; its siblings still run.
    pub async fn start_all(&self, callback: TriggerCallback) {
        for trigger in &self.triggers {
            if let Err(e) = trigger.start(Arc::clone(&callback)).await {
                error!("failed to start {} trigger: {e}", trigger.kind());
            } else {
                info!("started {} trigger", trigger.kind());
            }
        }
    }

    pub async fn stop_all(&self) {
        for trigger in &self.triggers {
            trigger.stop().await;
        }
    }
}

/// Builds the built-in trigger kinds from role config.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTriggerFactory;

impl TriggerDispatcherFactory for DefaultTriggerFactory {
    fn build(&self, triggers: &[TriggerConfig]) -> Arc<TriggerDispatcher> {
        let built: Vec<Arc<dyn Trigger>> = triggers
            .iter()
            .map(|config| match config {
                TriggerConfig::Cron {
                    schedule,
                    timezone,
                    prompt,
                } => Arc::new(CronTrigger::new(schedule.clone(), timezone.clone(), prompt.clone()))
                    as Arc<dyn Trigger>,
                TriggerConfig::FileWatch {
                    paths,
                    extensions,
                    debounce_seconds,
                    prompt_template,
                } => Arc::new(FileWatchTrigger::new(
                    paths.clone(),
                    extensions.clone(),
                    *debounce_seconds,
                    prompt_template.clone(),
                )) as Arc<dyn Trigger>,
                TriggerConfig::Webhook {
                    port,
                    path,
                    secret,
                    rate_limit_rpm,
                } => Arc::new(WebhookTrigger::new(*port, path.clone(), secret.clone(), *rate_limit_rpm))
                    as Arc<dyn Trigger>,
            })
            .collect();
        Arc::new(TriggerDispatcher::new(built))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = TriggerEvent::new("cron", "daily report").with_metadata("schedule", "0 0 9 * * * *");
        assert_eq!(event.trigger_type, "cron");
        assert_eq!(event.metadata["schedule"], "0 0 9 * * * *");
    }

    #[test]
    fn test_factory_builds_all_kinds() {
        let configs = vec![
            TriggerConfig::Cron {
                schedule: "0 0 9 * * * *".to_string(),
                timezone: "UTC".to_string(),
                prompt: "go".to_string(),
            },
            TriggerConfig::FileWatch {
                paths: vec!["/tmp".to_string()],
                extensions: vec![".md".to_string()],
                debounce_seconds: 2,
                prompt_template: "changed: {path}".to_string(),
            },
            TriggerConfig::Webhook {
                port: 0,
                path: "/hook".to_string(),
                secret: "s".to_string(),
                rate_limit_rpm: 60,
            },
        ];
        let dispatcher = DefaultTriggerFactory.build(&configs);
        assert_eq!(dispatcher.count(), 3);
    }
}
