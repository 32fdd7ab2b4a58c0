//! One long-running worker per agent service.
//!
//! Consumes the service inbox and trigger callbacks, runs the executor once
//! per event, writes an audit record, prunes memory sessions, and hands the
//! result to the sink dispatcher. Events for one service are strictly
//! serialized by an execution lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::logger::AuditLogger;
use crate::domain::models::compose::ServiceConfig;
use crate::domain::models::role::RoleDefinition;
use crate::domain::models::run::AuditRecord;
use crate::domain::ports::{AgentExecutor, RunSink, TriggerDispatcherFactory};
use crate::services::inbox::Inbox;
use crate::services::memory_store::MemoryStore;
use crate::sinks::SinkDispatcher;
use crate::triggers::{TriggerCallback, TriggerEvent};

const INBOX_POLL: Duration = Duration::from_millis(500);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A single service within a compose orchestration.
pub struct ComposeService {
    name: String,
    role: RoleDefinition,
    config: ServiceConfig,
    inbox: Arc<Inbox>,
    executor: Arc<dyn AgentExecutor>,
    audit: Option<Arc<AuditLogger>>,
    trigger_factory: Arc<dyn TriggerDispatcherFactory>,
    dispatcher: Arc<SinkDispatcher>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    execution_lock: tokio::sync::Mutex<()>,
    run_count: AtomicU64,
    error_count: AtomicU64,
}

impl ComposeService {
    pub fn new(
        name: impl Into<String>,
        role: RoleDefinition,
        config: ServiceConfig,
        inbox: Arc<Inbox>,
        executor: Arc<dyn AgentExecutor>,
        audit: Option<Arc<AuditLogger>>,
        trigger_factory: Arc<dyn TriggerDispatcherFactory>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(SinkDispatcher::new(role.clone()));
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            role,
            config,
            inbox,
            executor,
            audit,
            trigger_factory,
            dispatcher,
            stop_tx,
            worker: Mutex::new(None),
            execution_lock: tokio::sync::Mutex::new(()),
            run_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &RoleDefinition {
        &self.role
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Register a sink for this service's run results.
    pub fn add_sink(&self, sink: Arc<dyn RunSink>) {
        self.dispatcher.add_sink(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.dispatcher.count()
    }

    /// Whether the worker task is currently running.
    pub async fn is_alive(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Execute one prompt and dispatch the result. Serialized per service.
    pub async fn handle_prompt(
        &self,
        prompt: &str,
        trigger_type: Option<&str>,
        trigger_metadata: &HashMap<String, String>,
    ) {
        let _serialized = self.execution_lock.lock().await;

        let result = self
            .executor
            .execute(&self.role, prompt, trigger_type, trigger_metadata)
            .await;

        self.run_count.fetch_add(1, Ordering::SeqCst);
        if !result.success {
            self.error_count.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(audit) = &self.audit {
            let record =
                AuditRecord::from_run(&result, &self.role, prompt, trigger_type, trigger_metadata);
            audit.log(&record).await;
        }

        self.prune_memory_sessions().await;

        self.dispatcher
            .dispatch(&result, prompt, trigger_type, trigger_metadata)
            .await;
    }

    /// Prune stale memory sessions after a run. Failures are logged only.
    async fn prune_memory_sessions(&self) {
        let Some(memory) = &self.role.spec.memory else { return };
        let Some(store_path) = &memory.store_path else { return };
        match MemoryStore::open(std::path::Path::new(store_path)).await {
            Ok(store) => {
                if let Err(e) = store
                    .prune_sessions(&self.role.metadata.name, memory.max_sessions)
                    .await
                {
                    warn!("[{}] failed to prune memory sessions: {e}", self.name);
                }
                store.close().await;
            }
            Err(e) => warn!("[{}] failed to open memory store: {e}", self.name),
        }
    }

    fn make_trigger_callback(service: Arc<Self>) -> TriggerCallback {
        Arc::new(move |event: TriggerEvent| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                debug!(
                    "[{}] trigger ({}): {:.80}",
                    service.name, event.trigger_type, event.prompt
                );
                service
                    .handle_prompt(&event.prompt, Some(&event.trigger_type), &event.metadata)
                    .await;
            })
        })
    }

    /// Spawn the worker: start triggers, consume the inbox until stopped.
    pub async fn start(self: Arc<Self>) {
        let mut worker_slot = self.worker.lock().await;
        if worker_slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        // Fresh stop signal for this incarnation.
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();

        let service = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            // Triggers are rebuilt on every start so a restart gets a
            // fresh dispatcher.
            let triggers = (!service.role.spec.triggers.is_empty()).then(|| {
                service
                    .trigger_factory
                    .build(&service.role.spec.triggers)
            });
            if let Some(dispatcher) = &triggers {
                let callback = Self::make_trigger_callback(Arc::clone(&service));
                dispatcher.start_all(callback).await;
            }

            loop {
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    event = service.inbox.pop(INBOX_POLL) => {
                        let Some(event) = event else { continue };
                        debug!(
                            "[{}] delegate from {}: {:.80}",
                            service.name, event.source_service, event.prompt
                        );
                        service
                            .handle_prompt(&event.prompt, Some("delegate"), &event.metadata)
                            .await;
                    }
                }
            }

            if let Some(dispatcher) = &triggers {
                dispatcher.stop_all().await;
            }
            debug!("[{}] service worker exited", service.name);
        });
        *worker_slot = Some(handle);
        info!("[{}] service started", self.name);
    }

    /// Signal the worker and wait for it to unwind.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                error!("[{}] service worker did not stop in time", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::delegate::DelegateEvent;
    use crate::executor::MockExecutor;
    use crate::triggers::DefaultTriggerFactory;

    fn role(name: &str) -> RoleDefinition {
        RoleDefinition::from_yaml(&format!(
            "apiVersion: initrunner/v1\nkind: Role\nmetadata:\n  name: {name}\nspec:\n  model:\n    provider: anthropic\n    name: claude-sonnet-4-5\n"
        ))
        .unwrap()
    }

    fn service(executor: Arc<MockExecutor>) -> Arc<ComposeService> {
        let config = ServiceConfig {
            role: "worker.yaml".to_string(),
            depends_on: vec![],
            sink: None,
            restart: Default::default(),
            environment: Default::default(),
        };
        ComposeService::new(
            "worker",
            role("worker"),
            config,
            Arc::new(Inbox::new(4)),
            executor,
            None,
            Arc::new(DefaultTriggerFactory),
        )
    }

    #[tokio::test]
    async fn test_consumes_inbox_events() {
        let executor = Arc::new(MockExecutor::new());
        executor.respond_with("worker", "done").await;
        let svc = service(Arc::clone(&executor));

        Arc::clone(&svc).start().await;
        assert!(svc.is_alive().await);

        let event = DelegateEvent::new("upstream", "worker", "do the thing", "run-0");
        svc.inbox().push(event, Duration::ZERO).await;

        for _ in 0..100 {
            if svc.run_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        svc.stop().await;
        assert!(!svc.is_alive().await);

        assert_eq!(svc.run_count(), 1);
        assert_eq!(svc.error_count(), 0);
        let calls = executor.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].prompt, "do the thing");
        assert_eq!(calls[0].trigger_type.as_deref(), Some("delegate"));
    }

    #[tokio::test]
    async fn test_failed_runs_counted() {
        let executor = Arc::new(MockExecutor::new());
        executor.fail_with("worker", "model unavailable").await;
        let svc = service(Arc::clone(&executor));

        svc.handle_prompt("go", None, &HashMap::new()).await;

        assert_eq!(svc.run_count(), 1);
        assert_eq!(svc.error_count(), 1);
    }

    #[tokio::test]
    async fn test_restartable() {
        let executor = Arc::new(MockExecutor::new());
        let svc = service(executor);

        Arc::clone(&svc).start().await;
        svc.stop().await;
        assert!(!svc.is_alive().await);
        Arc::clone(&svc).start().await;
        assert!(svc.is_alive().await);
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_running() {
        let executor = Arc::new(MockExecutor::new());
        let svc = service(executor);
        Arc::clone(&svc).start().await;
        Arc::clone(&svc).start().await;
        assert!(svc.is_alive().await);
        svc.stop().await;
    }
}
