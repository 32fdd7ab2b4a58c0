//! Command-line interface.

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Declarative multi-agent runtime and compose orchestrator.
#[derive(Debug, Parser)]
#[command(name = "initrunner", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Multi-agent compose orchestration.
    #[command(subcommand)]
    Compose(ComposeCommands),

    /// Inspect and export audit records.
    #[command(subcommand)]
    Audit(AuditCommands),
}

#[derive(Debug, Subcommand)]
pub enum ComposeCommands {
    /// Validate a compose definition file.
    Validate {
        /// Path to compose YAML.
        compose_file: PathBuf,
    },

    /// Start a compose orchestration (foreground, Ctrl+C to stop).
    Up {
        /// Path to compose YAML.
        compose_file: PathBuf,
        /// Path to the audit database.
        #[arg(long)]
        audit_db: Option<PathBuf>,
        /// Disable audit logging.
        #[arg(long)]
        no_audit: bool,
    },

    /// Manage the systemd user unit for a compose project.
    #[command(subcommand)]
    Systemd(SystemdCommands),
}

#[derive(Debug, Subcommand)]
pub enum SystemdCommands {
    /// Install (or refresh) the systemd user unit.
    Install {
        /// Path to compose YAML.
        compose_file: PathBuf,
        /// Overwrite an existing unit.
        #[arg(long)]
        force: bool,
        /// Extra EnvironmentFile to reference from the unit.
        #[arg(long)]
        env_file: Option<PathBuf>,
        /// Executable to launch (defaults to the current binary).
        #[arg(long)]
        executable: Option<String>,
    },

    /// Stop, disable, and remove the unit.
    Uninstall {
        /// Compose name or path to compose YAML.
        name_or_path: String,
    },

    /// Show systemctl status for the unit.
    Status {
        /// Compose name or path to compose YAML.
        name_or_path: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum AuditCommands {
    /// Delete old audit records.
    Prune {
        /// Delete records older than this many days.
        #[arg(long, default_value_t = 90)]
        retention_days: i64,
        /// Maximum records to keep.
        #[arg(long, default_value_t = 100_000)]
        max_records: i64,
        /// Path to the audit database.
        #[arg(long)]
        audit_db: Option<PathBuf>,
    },

    /// Export audit records as JSON or CSV.
    Export {
        /// Output format: json or csv.
        #[arg(short, long, default_value = "json")]
        format: String,
        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Filter by agent name.
        #[arg(long)]
        agent: Option<String>,
        /// Filter by run ID.
        #[arg(long)]
        run_id: Option<String>,
        /// Filter by trigger type.
        #[arg(long)]
        trigger_type: Option<String>,
        /// Filter: timestamp >= RFC 3339 string.
        #[arg(long)]
        since: Option<String>,
        /// Filter: timestamp <= RFC 3339 string.
        #[arg(long)]
        until: Option<String>,
        /// Max records to return.
        #[arg(long, default_value_t = 1000)]
        limit: i64,
        /// Path to the audit database.
        #[arg(long)]
        audit_db: Option<PathBuf>,
    },

    /// List recent security events.
    Security {
        /// Filter by event type.
        #[arg(long)]
        event_type: Option<String>,
        /// Filter by agent name.
        #[arg(long)]
        agent: Option<String>,
        /// Max events to return.
        #[arg(long, default_value_t = 100)]
        limit: i64,
        /// Path to the audit database.
        #[arg(long)]
        audit_db: Option<PathBuf>,
    },

    /// List recent delegate routing events.
    Delegates {
        /// Filter by source service.
        #[arg(long)]
        source: Option<String>,
        /// Filter by target service.
        #[arg(long)]
        target: Option<String>,
        /// Filter by status.
        #[arg(long)]
        status: Option<String>,
        /// Max events to return.
        #[arg(long, default_value_t = 100)]
        limit: i64,
        /// Path to the audit database.
        #[arg(long)]
        audit_db: Option<PathBuf>,
    },
}
