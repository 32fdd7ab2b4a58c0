//! Append-only SQLite audit logger.
//!
//! Three tables share one database file: `audit_log` (agent runs),
//! `security_events`, and `delegate_events` (routing outcomes). All writes
//! go through a single-connection pool so they serialize exactly like a
//! mutex-guarded handle, and no write ever propagates an error to the
//! caller: failures are traced and swallowed. Secrets are scrubbed before
//! every INSERT.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::audit::redact::{scrub_opt, scrub_secrets};
use crate::domain::models::run::{AuditRecord, DelegateAuditEvent, SecurityEvent};

/// Errors raised while opening or querying the audit database.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to create audit directory: {0}")]
    Directory(#[source] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Retention and auto-prune settings.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Inserts between automatic prunes. Zero disables auto-prune.
    pub auto_prune_interval: u64,
    pub retention_days: i64,
    pub max_records: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            auto_prune_interval: 1000,
            retention_days: 90,
            max_records: 100_000,
        }
    }
}

const CREATE_AUDIT_LOG: &str = "\
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    user_prompt TEXT NOT NULL,
    model TEXT NOT NULL,
    provider TEXT NOT NULL,
    output TEXT NOT NULL,
    tokens_in INTEGER NOT NULL,
    tokens_out INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    tool_calls INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    success BOOLEAN NOT NULL,
    error TEXT,
    trigger_type TEXT,
    trigger_metadata TEXT
)";

const CREATE_SECURITY_EVENTS: &str = "\
CREATE TABLE IF NOT EXISTS security_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    details TEXT NOT NULL,
    source_ip TEXT
)";

const CREATE_DELEGATE_EVENTS: &str = "\
CREATE TABLE IF NOT EXISTS delegate_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    source_service TEXT NOT NULL,
    target_service TEXT NOT NULL,
    status TEXT NOT NULL,
    source_run_id TEXT NOT NULL,
    reason TEXT,
    trace TEXT,
    payload_preview TEXT NOT NULL
)";

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_agent_name ON audit_log (agent_name)",
    "CREATE INDEX IF NOT EXISTS idx_timestamp ON audit_log (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_run_id ON audit_log (run_id)",
    "CREATE INDEX IF NOT EXISTS idx_trigger_type ON audit_log (trigger_type)",
    "CREATE INDEX IF NOT EXISTS idx_sec_event_type ON security_events (event_type)",
    "CREATE INDEX IF NOT EXISTS idx_sec_timestamp ON security_events (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_sec_agent ON security_events (agent_name)",
    "CREATE INDEX IF NOT EXISTS idx_del_source ON delegate_events (source_service)",
    "CREATE INDEX IF NOT EXISTS idx_del_target ON delegate_events (target_service)",
    "CREATE INDEX IF NOT EXISTS idx_del_status ON delegate_events (status)",
    "CREATE INDEX IF NOT EXISTS idx_del_timestamp ON delegate_events (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_del_run_id ON delegate_events (source_run_id)",
];

/// Filters for querying run records.
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub agent_name: Option<String>,
    pub run_id: Option<String>,
    pub trigger_type: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<i64>,
}

impl RunQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn run_id(mut self, id: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self
    }

    pub fn trigger_type(mut self, trigger: impl Into<String>) -> Self {
        self.trigger_type = Some(trigger.into());
        self
    }

    pub fn since(mut self, timestamp: impl Into<String>) -> Self {
        self.since = Some(timestamp.into());
        self
    }

    pub fn until(mut self, timestamp: impl Into<String>) -> Self {
        self.until = Some(timestamp.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Filters for querying security events.
#[derive(Debug, Clone, Default)]
pub struct SecurityQuery {
    pub event_type: Option<String>,
    pub agent_name: Option<String>,
    pub limit: Option<i64>,
}

impl SecurityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, kind: impl Into<String>) -> Self {
        self.event_type = Some(kind.into());
        self
    }

    pub fn agent(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Filters for querying delegate routing events.
#[derive(Debug, Clone, Default)]
pub struct DelegateQuery {
    pub source_service: Option<String>,
    pub target_service: Option<String>,
    pub status: Option<String>,
    pub source_run_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<i64>,
}

impl DelegateQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, name: impl Into<String>) -> Self {
        self.source_service = Some(name.into());
        self
    }

    pub fn target(mut self, name: impl Into<String>) -> Self {
        self.target_service = Some(name.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn run_id(mut self, id: impl Into<String>) -> Self {
        self.source_run_id = Some(id.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

const DEFAULT_QUERY_LIMIT: i64 = 1000;

/// Append-only audit logger backed by SQLite.
pub struct AuditLogger {
    pool: SqlitePool,
    db_path: PathBuf,
    config: AuditConfig,
    insert_count: AtomicU64,
}

impl AuditLogger {
    /// Open (creating if missing) the audit database at `db_path`.
    ///
    /// The parent directory is created with owner-only permissions and the
    /// database file is restricted to 0600 after open.
    pub async fn open(db_path: &Path, config: AuditConfig) -> Result<Self, AuditError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                create_private_dir(parent).map_err(AuditError::Directory)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        // A single connection serializes writes across tasks, which is the
        // consistency contract the insert counter depends on.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        restrict_file_mode(db_path);

        let logger = Self {
            pool,
            db_path: db_path.to_path_buf(),
            config,
            insert_count: AtomicU64::new(0),
        };
        logger.init_schema().await?;
        Ok(logger)
    }

    /// Open with default retention settings.
    pub async fn open_default(db_path: &Path) -> Result<Self, AuditError> {
        Self::open(db_path, AuditConfig::default()).await
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn init_schema(&self) -> Result<(), AuditError> {
        sqlx::query(CREATE_AUDIT_LOG).execute(&self.pool).await?;
        sqlx::query(CREATE_SECURITY_EVENTS).execute(&self.pool).await?;
        sqlx::query(CREATE_DELEGATE_EVENTS).execute(&self.pool).await?;
        self.migrate_trigger_columns().await;
        for statement in INDEXES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Idempotent migration: add trigger columns to databases created before
    /// they existed. "duplicate column" failures are expected and ignored.
    async fn migrate_trigger_columns(&self) {
        for statement in [
            "ALTER TABLE audit_log ADD COLUMN trigger_type TEXT",
            "ALTER TABLE audit_log ADD COLUMN trigger_metadata TEXT",
        ] {
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                let message = e.to_string();
                if !message.contains("duplicate column") {
                    warn!("audit schema migration failed: {message}");
                }
            }
        }
    }

    /// Count one committed insert and auto-prune at the configured interval.
    async fn note_insert(&self) {
        let count = self.insert_count.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = self.config.auto_prune_interval;
        if interval > 0 && count % interval == 0 {
            let deleted = self
                .prune(self.config.retention_days, self.config.max_records)
                .await;
            debug!("audit auto-prune removed {deleted} record(s)");
        }
    }

    /// Insert an audit record. Never raises.
    pub async fn log(&self, record: &AuditRecord) {
        let result = sqlx::query(
            "INSERT INTO audit_log (
                run_id, agent_name, timestamp, user_prompt, model, provider,
                output, tokens_in, tokens_out, total_tokens, tool_calls,
                duration_ms, success, error, trigger_type, trigger_metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.run_id)
        .bind(&record.agent_name)
        .bind(&record.timestamp)
        .bind(scrub_secrets(&record.user_prompt))
        .bind(&record.model)
        .bind(&record.provider)
        .bind(scrub_secrets(&record.output))
        .bind(record.tokens_in as i64)
        .bind(record.tokens_out as i64)
        .bind(record.total_tokens as i64)
        .bind(i64::from(record.tool_calls))
        .bind(record.duration_ms as i64)
        .bind(record.success)
        .bind(scrub_opt(record.error.as_deref()))
        .bind(&record.trigger_type)
        .bind(&record.trigger_metadata)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.note_insert().await,
            Err(e) => error!("failed to write audit record: {e}"),
        }
    }

    /// Insert a security event. Never raises.
    pub async fn log_security_event(&self, event: &SecurityEvent) {
        let result = sqlx::query(
            "INSERT INTO security_events (timestamp, event_type, agent_name, details, source_ip)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.timestamp)
        .bind(&event.event_type)
        .bind(&event.agent_name)
        .bind(scrub_secrets(&event.details))
        .bind(&event.source_ip)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!("failed to write security event: {e}");
        }
    }

    /// Insert a delegate routing event. Never raises. The payload preview is
    /// truncated to 200 characters before scrubbing.
    pub async fn log_delegate_event(&self, event: &DelegateAuditEvent) {
        let preview: String = event.payload_preview.chars().take(200).collect();
        let result = sqlx::query(
            "INSERT INTO delegate_events (
                timestamp, source_service, target_service, status,
                source_run_id, reason, trace, payload_preview
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.timestamp)
        .bind(&event.source_service)
        .bind(&event.target_service)
        .bind(&event.status)
        .bind(&event.source_run_id)
        .bind(scrub_opt(event.reason.as_deref()))
        .bind(&event.trace)
        .bind(scrub_secrets(&preview))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.note_insert().await,
            Err(e) => error!("failed to write delegate event: {e}"),
        }
    }

    /// Query run records, newest first.
    pub async fn query(&self, filter: &RunQuery) -> Result<Vec<AuditRecord>, AuditError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM audit_log WHERE 1=1");
        if let Some(agent) = &filter.agent_name {
            builder.push(" AND agent_name = ").push_bind(agent);
        }
        if let Some(run_id) = &filter.run_id {
            builder.push(" AND run_id = ").push_bind(run_id);
        }
        if let Some(trigger) = &filter.trigger_type {
            builder.push(" AND trigger_type = ").push_bind(trigger);
        }
        if let Some(since) = &filter.since {
            builder.push(" AND timestamp >= ").push_bind(since);
        }
        if let Some(until) = &filter.until {
            builder.push(" AND timestamp <= ").push_bind(until);
        }
        builder
            .push(" ORDER BY timestamp DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT));

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    /// Query security events, newest first.
    pub async fn query_security_events(
        &self,
        filter: &SecurityQuery,
    ) -> Result<Vec<SecurityEvent>, AuditError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM security_events WHERE 1=1");
        if let Some(kind) = &filter.event_type {
            builder.push(" AND event_type = ").push_bind(kind);
        }
        if let Some(agent) = &filter.agent_name {
            builder.push(" AND agent_name = ").push_bind(agent);
        }
        builder
            .push(" ORDER BY timestamp DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT));

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| SecurityEvent {
                timestamp: row.get("timestamp"),
                event_type: row.get("event_type"),
                agent_name: row.get("agent_name"),
                details: row.get("details"),
                source_ip: row.get("source_ip"),
            })
            .collect())
    }

    /// Query delegate routing events, newest first.
    pub async fn query_delegate_events(
        &self,
        filter: &DelegateQuery,
    ) -> Result<Vec<DelegateAuditEvent>, AuditError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM delegate_events WHERE 1=1");
        if let Some(source) = &filter.source_service {
            builder.push(" AND source_service = ").push_bind(source);
        }
        if let Some(target) = &filter.target_service {
            builder.push(" AND target_service = ").push_bind(target);
        }
        if let Some(status) = &filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(run_id) = &filter.source_run_id {
            builder.push(" AND source_run_id = ").push_bind(run_id);
        }
        if let Some(since) = &filter.since {
            builder.push(" AND timestamp >= ").push_bind(since);
        }
        if let Some(until) = &filter.until {
            builder.push(" AND timestamp <= ").push_bind(until);
        }
        builder
            .push(" ORDER BY timestamp DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT));

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| DelegateAuditEvent {
                timestamp: row.get("timestamp"),
                source_service: row.get("source_service"),
                target_service: row.get("target_service"),
                status: row.get("status"),
                source_run_id: row.get("source_run_id"),
                reason: row.get("reason"),
                trace: row.get("trace"),
                payload_preview: row.get("payload_preview"),
            })
            .collect())
    }

    /// Delete rows older than `retention_days` across all tables, then trim
    /// the run table to the most recent `max_records` rows. Returns the
    /// number of run records deleted. Never raises.
    pub async fn prune(&self, retention_days: i64, max_records: i64) -> u64 {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).to_rfc3339();
        let mut deleted = 0u64;

        match sqlx::query("DELETE FROM audit_log WHERE timestamp < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
        {
            Ok(result) => deleted += result.rows_affected(),
            Err(e) => warn!("failed to prune audit records: {e}"),
        }

        for table in ["security_events", "delegate_events"] {
            if let Err(e) = sqlx::query(&format!("DELETE FROM {table} WHERE timestamp < ?"))
                .bind(&cutoff)
                .execute(&self.pool)
                .await
            {
                warn!("failed to prune {table}: {e}");
            }
        }

        match sqlx::query(
            "DELETE FROM audit_log WHERE id NOT IN
             (SELECT id FROM audit_log ORDER BY timestamp DESC LIMIT ?)",
        )
        .bind(max_records)
        .execute(&self.pool)
        .await
        {
            Ok(result) => deleted += result.rows_affected(),
            Err(e) => warn!("failed to trim audit records: {e}"),
        }

        deleted
    }

    /// A channel that forwards security events into this logger. Used by the
    /// sandbox, whose violation flush runs on worker threads with no direct
    /// async context.
    pub fn security_sink(self: Arc<Self>) -> mpsc::UnboundedSender<SecurityEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<SecurityEvent>();
        let logger = self;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                logger.log_security_event(&event).await;
            }
        });
        tx
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_record(row: &SqliteRow) -> AuditRecord {
    AuditRecord {
        run_id: row.get("run_id"),
        agent_name: row.get("agent_name"),
        timestamp: row.get("timestamp"),
        user_prompt: row.get("user_prompt"),
        model: row.get("model"),
        provider: row.get("provider"),
        output: row.get("output"),
        tokens_in: row.get::<i64, _>("tokens_in") as u64,
        tokens_out: row.get::<i64, _>("tokens_out") as u64,
        total_tokens: row.get::<i64, _>("total_tokens") as u64,
        tool_calls: row.get::<i64, _>("tool_calls") as u32,
        duration_ms: row.get::<i64, _>("duration_ms") as u64,
        success: row.get("success"),
        error: row.get("error"),
        trigger_type: row.get("trigger_type"),
        trigger_metadata: row.get("trigger_metadata"),
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if path.exists() {
        return Ok(());
    }
    std::fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

#[cfg(unix)]
fn restrict_file_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!("failed to restrict audit database permissions: {e}");
    }
}

#[cfg(not(unix))]
fn restrict_file_mode(_path: &Path) {}
