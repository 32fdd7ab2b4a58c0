//! Shared helpers for integration tests.

use std::path::Path;

use initrunner::domain::models::compose::ComposeDefinition;

/// Write a minimal role file into `dir`.
pub fn write_role(dir: &Path, name: &str) {
    std::fs::write(
        dir.join(format!("{name}.yaml")),
        format!(
            "apiVersion: initrunner/v1\n\
             kind: Role\n\
             metadata:\n\
             \x20 name: {name}\n\
             spec:\n\
             \x20 model:\n\
             \x20   provider: anthropic\n\
             \x20   name: claude-sonnet-4-5\n"
        ),
    )
    .unwrap();
}

/// Parse compose YAML, panicking on validation errors.
pub fn compose(yaml: &str) -> ComposeDefinition {
    ComposeDefinition::from_yaml(yaml).unwrap()
}

/// Poll until `predicate` returns true or the deadline passes.
pub async fn wait_until<F, Fut>(millis: u64, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(millis);
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
