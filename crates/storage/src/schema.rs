//! Table definitions and the fail-loud column presence check: startup
//! validation errors out hard if any required column is missing rather
//! than silently migrating around it.

use std::collections::HashSet;

use sbx_domain::error::{Error, Result};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sandbox_leases (
    lease_id TEXT PRIMARY KEY,
    provider_name TEXT NOT NULL,
    current_instance_id TEXT,
    instance_created_at TEXT,
    desired_state TEXT NOT NULL,
    observed_state TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    observed_at TEXT,
    last_error TEXT,
    needs_refresh INTEGER NOT NULL DEFAULT 0,
    refresh_hint_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sandbox_instances (
    instance_id TEXT PRIMARY KEY,
    lease_id TEXT NOT NULL REFERENCES sandbox_leases(lease_id),
    provider_session_id TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lease_events (
    event_id TEXT PRIMARY KEY,
    lease_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    source TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lease_events_lease_created
    ON lease_events(lease_id, created_at DESC);

CREATE TABLE IF NOT EXISTS abstract_terminals (
    terminal_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    lease_id TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    cwd TEXT NOT NULL,
    env_delta_json TEXT NOT NULL DEFAULT '{}',
    state_version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_abstract_terminals_thread
    ON abstract_terminals(thread_id);

CREATE TABLE IF NOT EXISTS chat_sessions (
    chat_session_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    terminal_id TEXT NOT NULL,
    lease_id TEXT NOT NULL,
    runtime_id TEXT,
    status TEXT NOT NULL,
    idle_ttl_sec INTEGER NOT NULL,
    max_duration_sec INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    ended_at TEXT,
    close_reason TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_chat_sessions_active_thread
    ON chat_sessions(thread_id)
    WHERE status IN ('active', 'idle', 'paused');

CREATE TABLE IF NOT EXISTS provider_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider_name TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    matched_lease_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_provider_events_created
    ON provider_events(created_at DESC);

CREATE TABLE IF NOT EXISTS run_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    data_json TEXT NOT NULL,
    message_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_run_events_thread_run_seq
    ON run_events(thread_id, run_id, seq);

CREATE TABLE IF NOT EXISTS terminal_commands (
    command_id TEXT PRIMARY KEY,
    terminal_id TEXT NOT NULL,
    lease_id TEXT NOT NULL,
    command TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_terminal_commands_terminal_status
    ON terminal_commands(terminal_id, status);
"#;

/// `(table, required columns)` — used by [`validate_schema`] to fail loudly
/// if a pre-existing database is missing a column this version requires.
fn required_columns() -> Vec<(&'static str, HashSet<&'static str>)> {
    vec![
        (
            "sandbox_leases",
            HashSet::from([
                "lease_id",
                "provider_name",
                "current_instance_id",
                "desired_state",
                "observed_state",
                "version",
                "observed_at",
                "last_error",
                "needs_refresh",
                "refresh_hint_at",
            ]),
        ),
        (
            "sandbox_instances",
            HashSet::from(["instance_id", "lease_id", "status", "created_at", "last_seen_at"]),
        ),
        (
            "lease_events",
            HashSet::from(["event_id", "lease_id", "event_type", "source", "payload_json"]),
        ),
        (
            "abstract_terminals",
            HashSet::from([
                "terminal_id",
                "thread_id",
                "lease_id",
                "cwd",
                "env_delta_json",
                "state_version",
            ]),
        ),
        (
            "chat_sessions",
            HashSet::from([
                "chat_session_id",
                "thread_id",
                "terminal_id",
                "lease_id",
                "status",
                "idle_ttl_sec",
                "max_duration_sec",
            ]),
        ),
        (
            "provider_events",
            HashSet::from(["event_id", "provider_name", "instance_id", "event_type", "matched_lease_id"]),
        ),
        (
            "run_events",
            HashSet::from(["seq", "thread_id", "run_id", "event_type", "data_json", "message_id"]),
        ),
    ]
}

pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

/// Fails loudly (returns `SchemaInconsistency`) if any required column is
/// absent from its table — never attempts to silently migrate.
pub async fn validate_schema(pool: &SqlitePool) -> Result<()> {
    for (table, required) in required_columns() {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(pool)
            .await?;
        let present: HashSet<String> = rows
            .iter()
            .map(|r| r.get::<String, _>("name"))
            .collect();
        for col in &required {
            if !present.contains(*col) {
                return Err(Error::SchemaInconsistency(format!(
                    "table {table} is missing required column {col}"
                )));
            }
        }
    }
    Ok(())
}
