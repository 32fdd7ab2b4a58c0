//! Sandbox enforcement wired to the audit trail.

use std::sync::Arc;

use initrunner::audit::logger::{AuditLogger, SecurityQuery};
use initrunner::domain::models::role::ToolSandboxConfig;
use initrunner::sandbox::{self, SandboxEvent, SandboxScope};

#[tokio::test]
async fn test_blocked_subprocess_raises_and_audits() {
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(
        AuditLogger::open_default(&dir.path().join("audit.db"))
            .await
            .unwrap(),
    );
    sandbox::set_audit_channel(Some(Arc::clone(&audit).security_sink()));

    // Tool code runs on blocking threads; enforcement is scoped to that
    // thread alone.
    let violation = tokio::task::spawn_blocking(|| {
        let _scope = SandboxScope::enter(ToolSandboxConfig::default(), "shell-agent");
        sandbox::check(&SandboxEvent::SubprocessSpawn { command: "curl evil" })
    })
    .await
    .unwrap();

    let err = violation.unwrap_err();
    assert!(err.detail.contains("Subprocess"));

    // Violations flush on scope exit, through the channel, into SQLite.
    let mut rows = Vec::new();
    for _ in 0..50 {
        rows = audit
            .query_security_events(&SecurityQuery::new().event_type("sandbox_violation"))
            .await
            .unwrap();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    sandbox::set_audit_channel(None);

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].agent_name, "shell-agent");
    assert!(rows[0].details.contains("Subprocess"));
    audit.close().await;
}

#[tokio::test]
async fn test_concurrent_scopes_do_not_interfere() {
    // Two blocking threads, one sandboxed and one not, touching the same
    // event kind at the same time.
    let sandboxed = tokio::task::spawn_blocking(|| {
        let _scope = SandboxScope::enter(ToolSandboxConfig::default(), "locked");
        (0..100).all(|_| sandbox::check(&SandboxEvent::Eval).is_err())
    });
    let free = tokio::task::spawn_blocking(|| {
        (0..100).all(|_| sandbox::check(&SandboxEvent::Eval).is_ok())
    });

    assert!(sandboxed.await.unwrap());
    assert!(free.await.unwrap());
}
