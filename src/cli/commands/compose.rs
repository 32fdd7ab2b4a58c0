//! Compose commands: validate, up, systemd lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use console::style;

use crate::audit::logger::{AuditConfig, AuditLogger};
use crate::domain::models::compose::ComposeDefinition;
use crate::executor::CommandExecutor;
use crate::infrastructure::settings::Settings;
use crate::infrastructure::systemd;
use crate::sandbox;
use crate::services::delegate_sink::CircuitState;
use crate::services::orchestrator::{ComposeOrchestrator, OrchestratorOptions};

fn services_table(compose: &ComposeDefinition) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Service", "Role", "Sink", "Depends On", "Restart"]);
    for (name, svc) in &compose.spec.services {
        let sink = svc.sink.as_ref().map_or_else(|| "(none)".to_string(), |s| s.summary());
        let deps = if svc.depends_on.is_empty() {
            "(none)".to_string()
        } else {
            svc.depends_on.join(", ")
        };
        table.add_row([
            name.as_str(),
            svc.role.as_str(),
            sink.as_str(),
            deps.as_str(),
            svc.restart.condition.as_str(),
        ]);
    }
    table
}

/// Validate a compose file and its role references.
pub fn handle_validate(compose_file: &Path) -> Result<()> {
    let compose = ComposeDefinition::from_path(compose_file)
        .with_context(|| format!("invalid compose file {}", compose_file.display()))?;

    println!("{}", services_table(&compose));

    let base_dir = compose_file.parent().unwrap_or(Path::new("."));
    let mut all_valid = true;
    for (name, svc) in &compose.spec.services {
        let role_path = base_dir.join(&svc.role);
        if !role_path.exists() {
            eprintln!(
                "{} role file not found for '{name}': {}",
                style("Error:").red(),
                role_path.display()
            );
            all_valid = false;
        }
    }

    if !all_valid {
        bail!("compose validation failed");
    }
    println!("{}", style("Valid").green());
    Ok(())
}

fn print_shutdown_summary(orchestrator: &ComposeOrchestrator) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Service", "Status", "Runs", "Errors"]);
    for (name, svc) in orchestrator.services() {
        let errors = svc.error_count();
        let error_cell = if errors > 0 {
            Cell::new(errors).fg(comfy_table::Color::Red)
        } else {
            Cell::new(errors)
        };
        table.add_row(vec![
            Cell::new(name),
            Cell::new("ok").fg(comfy_table::Color::Green),
            Cell::new(svc.run_count()),
            error_cell,
        ]);
    }
    for (name, reason) in orchestrator.failed_services() {
        table.add_row(vec![
            Cell::new(name),
            Cell::new("failed").fg(comfy_table::Color::Red),
            Cell::new("-"),
            Cell::new(reason),
        ]);
    }
    println!("{table}");

    let health = orchestrator.delegate_health();
    if !health.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Source", "Target", "Dropped", "Filtered", "Circuit"]);
        for edge in health {
            let circuit = if edge.circuit_state == CircuitState::Open {
                Cell::new(edge.circuit_state.as_str()).fg(comfy_table::Color::Red)
            } else {
                Cell::new(edge.circuit_state.as_str())
            };
            table.add_row(vec![
                Cell::new(&edge.source),
                Cell::new(&edge.target),
                Cell::new(edge.dropped_count),
                Cell::new(edge.filtered_count),
                circuit,
            ]);
        }
        println!("{table}");
    }
}

/// Run a compose orchestration in the foreground.
pub async fn handle_up(
    compose_file: &Path,
    audit_db: Option<PathBuf>,
    no_audit: bool,
    settings: &Settings,
) -> Result<()> {
    let compose = ComposeDefinition::from_path(compose_file)
        .with_context(|| format!("failed to load {}", compose_file.display()))?;
    let base_dir = compose_file
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let audit = if no_audit {
        None
    } else {
        let db_path = audit_db.unwrap_or_else(|| PathBuf::from(&settings.audit.db_path));
        let config = AuditConfig {
            auto_prune_interval: settings.audit.auto_prune_interval,
            retention_days: settings.audit.retention_days,
            max_records: settings.audit.max_records,
        };
        let logger = AuditLogger::open(&db_path, config)
            .await
            .context("failed to open audit database")?;
        Some(Arc::new(logger))
    };

    // Sandboxed tool violations flush through the audit trail.
    if let Some(audit) = &audit {
        sandbox::set_audit_channel(Some(Arc::clone(audit).security_sink()));
    }

    let executor = Arc::new(CommandExecutor::new(
        settings.executor.command.clone(),
        settings.executor.args.clone(),
    ));
    let mut options = OrchestratorOptions::new(executor)
        .with_memory_dir(PathBuf::from(&settings.memory.dir));
    if let Some(audit) = &audit {
        options = options.with_audit(Arc::clone(audit));
    }

    println!(
        "{} -- {} ({} services)",
        style("Compose").bold(),
        compose.metadata.name,
        compose.spec.services.len()
    );
    println!("{}", services_table(&compose));
    println!("Press Ctrl+C to stop.\n");

    let mut orchestrator = ComposeOrchestrator::new(compose, base_dir, options);
    let result = orchestrator.run().await;

    print_shutdown_summary(&orchestrator);
    sandbox::set_audit_channel(None);
    if let Some(audit) = &audit {
        audit.close().await;
    }
    result.context("compose orchestration failed")
}

/// Resolve a compose name from a name string or a YAML path.
pub fn resolve_compose_name(name_or_path: &str) -> Result<String> {
    let path = Path::new(name_or_path);
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    if is_yaml || path.exists() {
        if !path.exists() {
            bail!("compose file not found: {name_or_path}");
        }
        let compose = ComposeDefinition::from_path(path)?;
        return Ok(compose.metadata.name);
    }
    Ok(name_or_path.to_string())
}

/// Install the systemd user unit for a compose file.
pub fn handle_systemd_install(
    compose_file: &Path,
    force: bool,
    env_file: Option<PathBuf>,
    executable: Option<String>,
) -> Result<()> {
    let compose = ComposeDefinition::from_path(compose_file)?;
    let compose_path = compose_file
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", compose_file.display()))?;
    let executable = match executable {
        Some(executable) => executable,
        None => std::env::current_exe()
            .context("failed to resolve current executable")?
            .to_string_lossy()
            .to_string(),
    };

    let info = systemd::install_unit(
        &compose.metadata.name,
        &compose_path,
        &executable,
        env_file.as_deref(),
        force,
    )?;
    println!(
        "{} unit {} at {}",
        style("Installed").green(),
        info.unit_name,
        info.unit_path.display()
    );
    println!("Enable with: systemctl --user enable --now {}", info.unit_name);
    Ok(())
}

pub fn handle_systemd_uninstall(name_or_path: &str) -> Result<()> {
    let name = resolve_compose_name(name_or_path)?;
    let removed = systemd::uninstall_unit(&name)?;
    println!("{} {}", style("Removed").green(), removed.display());
    Ok(())
}

pub fn handle_systemd_status(name_or_path: &str) -> Result<()> {
    let name = resolve_compose_name(name_or_path)?;
    let status = systemd::unit_status(&name)?;
    print!("{status}");
    Ok(())
}
