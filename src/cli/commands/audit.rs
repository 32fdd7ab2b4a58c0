//! Audit commands: prune, export, security and delegate listings.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use console::style;

use crate::audit::export;
use crate::audit::logger::{AuditLogger, DelegateQuery, RunQuery, SecurityQuery};
use crate::infrastructure::settings::Settings;

async fn open_existing(audit_db: Option<PathBuf>, settings: &Settings) -> Result<AuditLogger> {
    let db_path = audit_db.unwrap_or_else(|| PathBuf::from(&settings.audit.db_path));
    if !db_path.exists() {
        bail!("audit database not found at {}", db_path.display());
    }
    AuditLogger::open_default(&db_path)
        .await
        .context("failed to open audit database")
}

pub async fn handle_prune(
    retention_days: i64,
    max_records: i64,
    audit_db: Option<PathBuf>,
    settings: &Settings,
) -> Result<()> {
    let logger = open_existing(audit_db, settings).await?;
    let deleted = logger.prune(retention_days, max_records).await;
    logger.close().await;
    println!("{} {deleted} record(s).", style("Pruned").green());
    Ok(())
}

pub async fn handle_export(
    format: &str,
    output: Option<&Path>,
    filter: RunQuery,
    audit_db: Option<PathBuf>,
    settings: &Settings,
) -> Result<()> {
    if format != "json" && format != "csv" {
        bail!("unknown format '{format}', use: json, csv");
    }

    let logger = open_existing(audit_db, settings).await?;
    let records = logger.query(&filter).await?;
    logger.close().await;

    let text = if format == "json" {
        export::to_json(&records)
    } else {
        export::to_csv(&records)
    };

    match output {
        Some(path) => {
            std::fs::write(path, &text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "{} {} record(s) to {}.",
                style("Exported").green(),
                records.len(),
                path.display()
            );
        }
        None => print!("{text}"),
    }
    Ok(())
}

pub async fn handle_security(
    filter: SecurityQuery,
    audit_db: Option<PathBuf>,
    settings: &Settings,
) -> Result<()> {
    let logger = open_existing(audit_db, settings).await?;
    let events = logger.query_security_events(&filter).await?;
    logger.close().await;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Timestamp", "Type", "Agent", "Details"]);
    for event in &events {
        table.add_row([
            event.timestamp.as_str(),
            event.event_type.as_str(),
            event.agent_name.as_str(),
            event.details.as_str(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn handle_delegates(
    filter: DelegateQuery,
    audit_db: Option<PathBuf>,
    settings: &Settings,
) -> Result<()> {
    let logger = open_existing(audit_db, settings).await?;
    let events = logger.query_delegate_events(&filter).await?;
    logger.close().await;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Timestamp", "Source", "Target", "Status", "Reason"]);
    for event in &events {
        table.add_row([
            event.timestamp.as_str(),
            event.source_service.as_str(),
            event.target_service.as_str(),
            event.status.as_str(),
            event.reason.as_deref().unwrap_or(""),
        ]);
    }
    println!("{table}");
    Ok(())
}
