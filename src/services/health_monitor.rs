//! Health monitor: restart policy enforcement for compose services.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::domain::models::compose::RestartCondition;
use crate::services::compose_service::ComposeService;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically checks service liveness and applies restart policies.
pub struct HealthMonitor {
    services: BTreeMap<String, Arc<ComposeService>>,
    check_interval: Duration,
    restart_counts: Mutex<BTreeMap<String, u32>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(services: BTreeMap<String, Arc<ComposeService>>) -> Arc<Self> {
        Self::with_interval(services, DEFAULT_CHECK_INTERVAL)
    }

    pub fn with_interval(
        services: BTreeMap<String, Arc<ComposeService>>,
        check_interval: Duration,
    ) -> Arc<Self> {
        let restart_counts = services.keys().map(|name| (name.clone(), 0)).collect();
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            services,
            check_interval,
            restart_counts: Mutex::new(restart_counts),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    /// Per-service restart attempt counts.
    pub async fn restart_counts(&self) -> BTreeMap<String, u32> {
        self.restart_counts.lock().await.clone()
    }

    /// One pass over all services: restart the dead ones whose policy allows
    /// it, waiting out the configured delay interruptibly.
    pub async fn run_checks_once(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        for (name, service) in &self.services {
            if *stop_rx.borrow() {
                return;
            }
            if service.is_alive().await {
                continue;
            }

            let policy = &service.config().restart;
            if policy.condition == RestartCondition::None {
                continue;
            }
            if policy.condition == RestartCondition::OnFailure && service.error_count() == 0 {
                continue;
            }

            let attempt = {
                let mut counts = self.restart_counts.lock().await;
                let count = counts.entry(name.clone()).or_insert(0);
                if *count >= policy.max_retries {
                    error!(
                        "service '{name}' exceeded max restarts ({}), not restarting",
                        policy.max_retries
                    );
                    continue;
                }
                *count += 1;
                *count
            };

            warn!(
                "restarting service '{name}' (attempt {attempt}/{})",
                policy.max_retries
            );

            // Interruptible backoff so shutdown during the delay is prompt.
            tokio::select! {
                _ = stop_rx.changed() => return,
                () = tokio::time::sleep(Duration::from_secs(policy.delay_seconds)) => {}
            }

            Arc::clone(service).start().await;
        }
    }

    pub async fn start(self: Arc<Self>) {
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let monitor = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    () = tokio::time::sleep(monitor.check_interval) => {}
                }
                if *stop_rx.borrow() {
                    return;
                }
                monitor.run_checks_once().await;
            }
        });
        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::compose::{RestartPolicy, ServiceConfig};
    use crate::domain::models::role::RoleDefinition;
    use crate::executor::MockExecutor;
    use crate::services::inbox::Inbox;
    use crate::triggers::DefaultTriggerFactory;

    fn service(name: &str, condition: RestartCondition, max_retries: u32) -> Arc<ComposeService> {
        let role = RoleDefinition::from_yaml(&format!(
            "apiVersion: initrunner/v1\nkind: Role\nmetadata:\n  name: {name}\nspec:\n  model:\n    provider: anthropic\n    name: claude-sonnet-4-5\n"
        ))
        .unwrap();
        let config = ServiceConfig {
            role: format!("{name}.yaml"),
            depends_on: vec![],
            sink: None,
            restart: RestartPolicy {
                condition,
                max_retries,
                delay_seconds: 0,
            },
            environment: Default::default(),
        };
        ComposeService::new(
            name,
            role,
            config,
            Arc::new(Inbox::new(4)),
            Arc::new(MockExecutor::new()),
            None,
            Arc::new(DefaultTriggerFactory),
        )
    }

    fn monitor_for(services: &[Arc<ComposeService>]) -> Arc<HealthMonitor> {
        let map: BTreeMap<String, Arc<ComposeService>> = services
            .iter()
            .map(|s| (s.name().to_string(), Arc::clone(s)))
            .collect();
        HealthMonitor::with_interval(map, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_restarts_dead_service() {
        let svc = service("a", RestartCondition::Always, 3);
        let monitor = monitor_for(&[Arc::clone(&svc)]);

        assert!(!svc.is_alive().await);
        monitor.run_checks_once().await;

        assert!(svc.is_alive().await);
        assert_eq!(monitor.restart_counts().await["a"], 1);
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_none_policy_skipped() {
        let svc = service("a", RestartCondition::None, 3);
        let monitor = monitor_for(&[Arc::clone(&svc)]);

        monitor.run_checks_once().await;

        assert!(!svc.is_alive().await);
        assert_eq!(monitor.restart_counts().await["a"], 0);
    }

    #[tokio::test]
    async fn test_on_failure_requires_errors() {
        let svc = service("a", RestartCondition::OnFailure, 3);
        let monitor = monitor_for(&[Arc::clone(&svc)]);

        monitor.run_checks_once().await;
        assert!(!svc.is_alive().await);
        assert_eq!(monitor.restart_counts().await["a"], 0);
    }

    #[tokio::test]
    async fn test_retry_ceiling_enforced() {
        let svc = service("a", RestartCondition::Always, 2);
        let monitor = monitor_for(&[Arc::clone(&svc)]);

        for _ in 0..4 {
            monitor.run_checks_once().await;
            svc.stop().await;
        }

        // Two restarts happened, the third and fourth passes skipped.
        assert_eq!(monitor.restart_counts().await["a"], 2);
        assert!(!svc.is_alive().await);
    }

    #[tokio::test]
    async fn test_alive_service_untouched() {
        let svc = service("a", RestartCondition::Always, 3);
        Arc::clone(&svc).start().await;
        let monitor = monitor_for(&[Arc::clone(&svc)]);

        monitor.run_checks_once().await;
        assert_eq!(monitor.restart_counts().await["a"], 0);
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_background_loop_restarts() {
        let svc = service("a", RestartCondition::Always, 3);
        let monitor = monitor_for(&[Arc::clone(&svc)]);

        Arc::clone(&monitor).start().await;
        for _ in 0..100 {
            if svc.is_alive().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        monitor.stop().await;

        assert!(svc.is_alive().await);
        svc.stop().await;
    }
}
