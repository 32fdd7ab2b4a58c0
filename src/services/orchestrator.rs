//! Multi-service compose orchestrator.
//!
//! Owns every service and inbox: builds services in dependency-tier order,
//! wires delegate edges, supervises restarts, and unwinds everything in
//! reverse order on shutdown.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::audit::logger::AuditLogger;
use crate::domain::models::compose::{ComposeDefinition, ComposeError, RestartCondition};
use crate::domain::models::role::RoleDefinition;
use crate::domain::ports::{AgentExecutor, TriggerDispatcherFactory};
use crate::services::compose_service::ComposeService;
use crate::services::delegate_sink::{CircuitState, DelegateSink, DelegateSinkOptions};
use crate::services::health_monitor::HealthMonitor;
use crate::services::inbox::Inbox;
use crate::sinks::build_sink;
use crate::triggers::DefaultTriggerFactory;

/// Per-edge routing health snapshot.
#[derive(Debug, Clone)]
pub struct DelegateEdgeHealth {
    pub source: String,
    pub target: String,
    pub dropped_count: u64,
    pub filtered_count: u64,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
}

/// Construction options beyond the compose definition itself.
pub struct OrchestratorOptions {
    pub executor: Arc<dyn AgentExecutor>,
    pub audit: Option<Arc<AuditLogger>>,
    pub trigger_factory: Arc<dyn TriggerDispatcherFactory>,
    /// Directory for derived shared-memory stores.
    pub default_memory_dir: PathBuf,
}

impl OrchestratorOptions {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            executor,
            audit: None,
            trigger_factory: Arc::new(DefaultTriggerFactory),
            default_memory_dir: PathBuf::from(".initrunner/memory"),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_trigger_factory(mut self, factory: Arc<dyn TriggerDispatcherFactory>) -> Self {
        self.trigger_factory = factory;
        self
    }

    pub fn with_memory_dir(mut self, dir: PathBuf) -> Self {
        self.default_memory_dir = dir;
        self
    }
}

/// Manages the lifecycle of all compose services.
pub struct ComposeOrchestrator {
    compose: ComposeDefinition,
    base_dir: PathBuf,
    executor: Arc<dyn AgentExecutor>,
    audit: Option<Arc<AuditLogger>>,
    trigger_factory: Arc<dyn TriggerDispatcherFactory>,
    default_memory_dir: PathBuf,
    services: BTreeMap<String, Arc<ComposeService>>,
    failed_services: BTreeMap<String, String>,
    delegate_sinks: Vec<Arc<DelegateSink>>,
    health_monitor: Option<Arc<HealthMonitor>>,
    shutdown: Arc<Notify>,
}

impl ComposeOrchestrator {
    pub fn new(compose: ComposeDefinition, base_dir: PathBuf, options: OrchestratorOptions) -> Self {
        Self {
            compose,
            base_dir,
            executor: options.executor,
            audit: options.audit,
            trigger_factory: options.trigger_factory,
            default_memory_dir: options.default_memory_dir,
            services: BTreeMap::new(),
            failed_services: BTreeMap::new(),
            delegate_sinks: Vec::new(),
            health_monitor: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn compose(&self) -> &ComposeDefinition {
        &self.compose
    }

    pub fn services(&self) -> &BTreeMap<String, Arc<ComposeService>> {
        &self.services
    }

    pub fn failed_services(&self) -> &BTreeMap<String, String> {
        &self.failed_services
    }

    /// Ask a running `run()` to unwind. Safe from any task.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Per-edge routing health.
    pub fn delegate_health(&self) -> Vec<DelegateEdgeHealth> {
        self.delegate_sinks
            .iter()
            .map(|sink| DelegateEdgeHealth {
                source: sink.source_service().to_string(),
                target: sink.target_service().to_string(),
                dropped_count: sink.dropped_count(),
                filtered_count: sink.filtered_count(),
                circuit_state: sink.circuit_state(),
                consecutive_failures: sink.consecutive_failures(),
            })
            .collect()
    }

    fn load_role(&self, role_rel: &str, shared: Option<(&str, usize)>) -> Result<RoleDefinition, String> {
        let role_path = self.base_dir.join(role_rel);
        let mut role =
            RoleDefinition::from_path(&role_path).map_err(|e| format!("role load: {e}"))?;
        if let Some((store_path, max_memories)) = shared {
            role.apply_shared_memory(store_path, max_memories);
        }
        Ok(role)
    }

    /// Load roles and create service instances. Individual failures are
    /// recorded and siblings continue; every service failing is fatal.
    fn build_services(&mut self) -> Result<(), ComposeError> {
        let shared_memory = &self.compose.spec.shared_memory;
        let shared_path = shared_memory.enabled.then(|| {
            shared_memory.store_path.clone().unwrap_or_else(|| {
                self.default_memory_dir
                    .join(format!("{}-shared.db", self.compose.metadata.name))
                    .to_string_lossy()
                    .to_string()
            })
        });

        for (name, config) in &self.compose.spec.services {
            let shared = shared_path
                .as_deref()
                .map(|path| (path, shared_memory.max_memories));
            let role = match self.load_role(&config.role, shared) {
                Ok(role) => role,
                Err(message) => {
                    error!("failed to build service '{name}': {message}");
                    self.failed_services.insert(name.clone(), message);
                    continue;
                }
            };

            let queue_size = config.sink.as_ref().map_or(100, |sink| sink.queue_size);
            let inbox = Arc::new(Inbox::new(queue_size));

            let service = ComposeService::new(
                name.clone(),
                role.clone(),
                config.clone(),
                inbox,
                Arc::clone(&self.executor),
                self.audit.clone(),
                Arc::clone(&self.trigger_factory),
            );

            // Role sinks are built when no compose sink replaces them, or
            // when the delegate sink explicitly keeps them.
            let build_role_sinks = config
                .sink
                .as_ref()
                .map_or(true, |sink| sink.keep_existing_sinks);
            if build_role_sinks {
                let role_path = self.base_dir.join(&config.role);
                let role_dir = role_path.parent().unwrap_or(&self.base_dir);
                for sink_config in &role.spec.sinks {
                    service.add_sink(build_sink(sink_config, role_dir));
                }
            }

            self.services.insert(name.clone(), service);
        }

        if self.services.is_empty() {
            let failed: Vec<String> = self.failed_services.keys().cloned().collect();
            return Err(ComposeError::AllServicesFailed(failed.join(", ")));
        }
        Ok(())
    }

    /// Create delegate sinks and register them with their source services.
    fn wire_delegates(&mut self) {
        for (name, config) in &self.compose.spec.services {
            let Some(sink_config) = &config.sink else { continue };
            let Some(source) = self.services.get(name) else { continue };

            for target_name in sink_config.target.as_list() {
                let Some(target) = self.services.get(&target_name) else {
                    warn!("skipping delegate {name} -> {target_name}: target service not available");
                    continue;
                };
                let sink = DelegateSink::new(
                    name.clone(),
                    target_name.clone(),
                    Arc::clone(target.inbox()),
                    DelegateSinkOptions {
                        timeout: Duration::from_secs(sink_config.timeout_seconds),
                        audit: self.audit.clone(),
                        circuit_breaker_threshold: sink_config.circuit_breaker_threshold,
                        circuit_breaker_reset: Duration::from_secs(
                            sink_config.circuit_breaker_reset_seconds,
                        ),
                    },
                );
                source.add_sink(Arc::clone(&sink) as Arc<dyn crate::domain::ports::RunSink>);
                self.delegate_sinks.push(sink);
            }
        }
    }

    fn startup_tiers(&self) -> Vec<Vec<String>> {
        let surviving: BTreeSet<String> = self.services.keys().cloned().collect();
        self.compose.tiers_for(&surviving)
    }

    /// Build, wire, and start all services in dependency-tier order.
    pub async fn start(&mut self) -> Result<(), ComposeError> {
        self.build_services()?;
        self.wire_delegates();

        let needs_monitor = self
            .services
            .values()
            .any(|service| service.config().restart.condition != RestartCondition::None);
        if needs_monitor {
            let monitor = HealthMonitor::new(self.services.clone());
            Arc::clone(&monitor).start().await;
            self.health_monitor = Some(monitor);
        }

        for tier in self.startup_tiers() {
            for name in tier {
                if let Some(service) = self.services.get(&name) {
                    Arc::clone(service).start().await;
                }
            }
        }
        info!(
            "compose '{}' started ({} services)",
            self.compose.metadata.name,
            self.services.len()
        );
        Ok(())
    }

    /// Stop the monitor, all services in reverse tier order, then flush
    /// every delegate sink.
    pub async fn stop(&mut self) {
        if let Some(monitor) = self.health_monitor.take() {
            monitor.stop().await;
        }
        for tier in self.startup_tiers().into_iter().rev() {
            for name in tier {
                if let Some(service) = self.services.get(&name) {
                    service.stop().await;
                }
            }
        }
        for sink in &self.delegate_sinks {
            sink.close().await;
        }
        info!("compose '{}' stopped", self.compose.metadata.name);
    }

    /// Start, block until an interrupt signal or [`Self::shutdown_handle`]
    /// fires, then stop.
    pub async fn run(&mut self) -> Result<(), ComposeError> {
        self.start().await?;
        let shutdown = Arc::clone(&self.shutdown);
        tokio::select! {
            () = wait_for_signal() => {
                info!("interrupt received, shutting down compose");
            }
            () = shutdown.notified() => {
                info!("shutdown requested, stopping compose");
            }
        }
        self.stop().await;
        Ok(())
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM (systemd's stop signal).
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;

    fn write_role(dir: &std::path::Path, name: &str) {
        std::fs::write(
            dir.join(format!("{name}.yaml")),
            format!(
                "apiVersion: initrunner/v1\nkind: Role\nmetadata:\n  name: {name}\nspec:\n  model:\n    provider: anthropic\n    name: claude-sonnet-4-5\n"
            ),
        )
        .unwrap();
    }

    fn compose_two() -> ComposeDefinition {
        ComposeDefinition::from_yaml(
            "apiVersion: initrunner/v1\nkind: Compose\nmetadata:\n  name: pair\nspec:\n  services:\n    a:\n      role: a.yaml\n      sink:\n        target: b\n    b:\n      role: b.yaml\n      depends_on: [a]\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_wires_delegates() {
        let dir = tempfile::tempdir().unwrap();
        write_role(dir.path(), "a");
        write_role(dir.path(), "b");

        let mut orchestrator = ComposeOrchestrator::new(
            compose_two(),
            dir.path().to_path_buf(),
            OrchestratorOptions::new(Arc::new(MockExecutor::new())),
        );
        orchestrator.start().await.unwrap();

        assert_eq!(orchestrator.services().len(), 2);
        assert!(orchestrator.failed_services().is_empty());
        let health = orchestrator.delegate_health();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].source, "a");
        assert_eq!(health[0].target, "b");
        assert_eq!(orchestrator.services()["a"].sink_count(), 1);

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_partial_build_failure_survives() {
        let dir = tempfile::tempdir().unwrap();
        write_role(dir.path(), "a");
        // b.yaml is missing.

        let mut orchestrator = ComposeOrchestrator::new(
            compose_two(),
            dir.path().to_path_buf(),
            OrchestratorOptions::new(Arc::new(MockExecutor::new())),
        );
        orchestrator.start().await.unwrap();

        assert_eq!(orchestrator.services().len(), 1);
        assert!(orchestrator.failed_services().contains_key("b"));
        // The delegate edge to the missing target was skipped.
        assert!(orchestrator.delegate_health().is_empty());

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_all_failed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = ComposeOrchestrator::new(
            compose_two(),
            dir.path().to_path_buf(),
            OrchestratorOptions::new(Arc::new(MockExecutor::new())),
        );
        let err = orchestrator.start().await.unwrap_err();
        assert!(matches!(err, ComposeError::AllServicesFailed(_)));
    }

    #[tokio::test]
    async fn test_shared_memory_override() {
        let dir = tempfile::tempdir().unwrap();
        write_role(dir.path(), "a");
        write_role(dir.path(), "b");

        let compose = ComposeDefinition::from_yaml(
            "apiVersion: initrunner/v1\nkind: Compose\nmetadata:\n  name: shared\nspec:\n  services:\n    a:\n      role: a.yaml\n    b:\n      role: b.yaml\n  shared_memory:\n    enabled: true\n    max_memories: 42\n",
        )
        .unwrap();

        let mut orchestrator = ComposeOrchestrator::new(
            compose,
            dir.path().to_path_buf(),
            OrchestratorOptions::new(Arc::new(MockExecutor::new()))
                .with_memory_dir(dir.path().join("memory")),
        );
        orchestrator.start().await.unwrap();

        for service in orchestrator.services().values() {
            let memory = service.role().spec.memory.as_ref().unwrap();
            assert!(memory.store_path.as_deref().unwrap().ends_with("shared-shared.db"));
            assert_eq!(memory.max_memories, 42);
        }
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_role_memory_untouched_when_shared_disabled() {
        let dir = tempfile::tempdir().unwrap();
        write_role(dir.path(), "a");
        write_role(dir.path(), "b");

        let mut orchestrator = ComposeOrchestrator::new(
            compose_two(),
            dir.path().to_path_buf(),
            OrchestratorOptions::new(Arc::new(MockExecutor::new())),
        );
        orchestrator.start().await.unwrap();
        assert!(orchestrator.services()["a"].role().spec.memory.is_none());
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_run_unwinds_on_shutdown_handle() {
        let dir = tempfile::tempdir().unwrap();
        write_role(dir.path(), "a");
        write_role(dir.path(), "b");

        let mut orchestrator = ComposeOrchestrator::new(
            compose_two(),
            dir.path().to_path_buf(),
            OrchestratorOptions::new(Arc::new(MockExecutor::new())),
        );
        let shutdown = orchestrator.shutdown_handle();
        let runner = tokio::spawn(async move {
            orchestrator.run().await.unwrap();
            orchestrator
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.notify_one();
        let orchestrator = runner.await.unwrap();
        assert!(!orchestrator.services()["a"].is_alive().await);
    }
}
