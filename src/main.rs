//! InitRunner CLI entry point.

use anyhow::Result;
use clap::Parser;

use initrunner::audit::logger::{DelegateQuery, RunQuery, SecurityQuery};
use initrunner::cli::commands::{audit, compose};
use initrunner::cli::{AuditCommands, Cli, Commands, ComposeCommands, SystemdCommands};
use initrunner::infrastructure::logging::init_tracing;
use initrunner::infrastructure::settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    init_tracing(&settings.logging);

    match cli.command {
        Commands::Compose(command) => match command {
            ComposeCommands::Validate { compose_file } => compose::handle_validate(&compose_file),
            ComposeCommands::Up {
                compose_file,
                audit_db,
                no_audit,
            } => compose::handle_up(&compose_file, audit_db, no_audit, &settings).await,
            ComposeCommands::Systemd(command) => match command {
                SystemdCommands::Install {
                    compose_file,
                    force,
                    env_file,
                    executable,
                } => compose::handle_systemd_install(&compose_file, force, env_file, executable),
                SystemdCommands::Uninstall { name_or_path } => {
                    compose::handle_systemd_uninstall(&name_or_path)
                }
                SystemdCommands::Status { name_or_path } => {
                    compose::handle_systemd_status(&name_or_path)
                }
            },
        },
        Commands::Audit(command) => match command {
            AuditCommands::Prune {
                retention_days,
                max_records,
                audit_db,
            } => audit::handle_prune(retention_days, max_records, audit_db, &settings).await,
            AuditCommands::Export {
                format,
                output,
                agent,
                run_id,
                trigger_type,
                since,
                until,
                limit,
                audit_db,
            } => {
                let mut filter = RunQuery::new().limit(limit);
                filter.agent_name = agent;
                filter.run_id = run_id;
                filter.trigger_type = trigger_type;
                filter.since = since;
                filter.until = until;
                audit::handle_export(&format, output.as_deref(), filter, audit_db, &settings).await
            }
            AuditCommands::Security {
                event_type,
                agent,
                limit,
                audit_db,
            } => {
                let mut filter = SecurityQuery::new().limit(limit);
                filter.event_type = event_type;
                filter.agent_name = agent;
                audit::handle_security(filter, audit_db, &settings).await
            }
            AuditCommands::Delegates {
                source,
                target,
                status,
                limit,
                audit_db,
            } => {
                let mut filter = DelegateQuery::new().limit(limit);
                filter.source_service = source;
                filter.target_service = target;
                filter.status = status;
                audit::handle_delegates(filter, audit_db, &settings).await
            }
        },
    }
}
