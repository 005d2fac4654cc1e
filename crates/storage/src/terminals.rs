//! `abstract_terminals` accessor.

use chrono::{DateTime, Utc};
use sbx_domain::error::Result;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct TerminalRow {
    pub terminal_id: String,
    pub thread_id: String,
    pub lease_id: String,
    pub is_default: bool,
    pub cwd: String,
    pub env_delta_json: String,
    pub state_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_terminal(row: &sqlx::sqlite::SqliteRow) -> TerminalRow {
    TerminalRow {
        terminal_id: row.get("terminal_id"),
        thread_id: row.get("thread_id"),
        lease_id: row.get("lease_id"),
        is_default: row.get::<i64, _>("is_default") != 0,
        cwd: row.get("cwd"),
        env_delta_json: row.get("env_delta_json"),
        state_version: row.get("state_version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &SqlitePool,
    terminal_id: &str,
    thread_id: &str,
    lease_id: &str,
    is_default: bool,
    cwd: &str,
    env_delta_json: &str,
) -> Result<TerminalRow> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO abstract_terminals \
         (terminal_id, thread_id, lease_id, is_default, cwd, env_delta_json, state_version, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(terminal_id)
    .bind(thread_id)
    .bind(lease_id)
    .bind(is_default as i64)
    .bind(cwd)
    .bind(env_delta_json)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(TerminalRow {
        terminal_id: terminal_id.to_string(),
        thread_id: thread_id.to_string(),
        lease_id: lease_id.to_string(),
        is_default,
        cwd: cwd.to_string(),
        env_delta_json: env_delta_json.to_string(),
        state_version: 0,
        created_at: now,
        updated_at: now,
    })
}

pub async fn get_by_id(pool: &SqlitePool, terminal_id: &str) -> Result<Option<TerminalRow>> {
    let row = sqlx::query("SELECT * FROM abstract_terminals WHERE terminal_id = ?")
        .bind(terminal_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_terminal))
}

pub async fn get_default_by_thread(pool: &SqlitePool, thread_id: &str) -> Result<Option<TerminalRow>> {
    let row = sqlx::query(
        "SELECT * FROM abstract_terminals WHERE thread_id = ? AND is_default = 1 LIMIT 1",
    )
    .bind(thread_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_terminal))
}

pub async fn list_by_thread(pool: &SqlitePool, thread_id: &str) -> Result<Vec<TerminalRow>> {
    let rows = sqlx::query("SELECT * FROM abstract_terminals WHERE thread_id = ?")
        .bind(thread_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_terminal).collect())
}

pub async fn list_by_lease(pool: &SqlitePool, lease_id: &str) -> Result<Vec<TerminalRow>> {
    let rows = sqlx::query("SELECT * FROM abstract_terminals WHERE lease_id = ?")
        .bind(lease_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_terminal).collect())
}

/// Bumps `state_version` and persists the new snapshot. Callers must hold
/// whatever runtime-level serialization guarantees only one writer mutates
/// a given terminal at a time — a `PhysicalTerminalRuntime` calls this only
/// after a command completes.
pub async fn update_state(
    pool: &SqlitePool,
    terminal_id: &str,
    cwd: &str,
    env_delta_json: &str,
) -> Result<i64> {
    let current = get_by_id(pool, terminal_id)
        .await?
        .ok_or_else(|| sbx_domain::error::Error::SchemaInconsistency(format!("terminal {terminal_id} not found")))?;
    let next_version = current.state_version + 1;

    sqlx::query(
        "UPDATE abstract_terminals SET cwd = ?, env_delta_json = ?, state_version = ?, updated_at = ? \
         WHERE terminal_id = ?",
    )
    .bind(cwd)
    .bind(env_delta_json)
    .bind(next_version)
    .bind(Utc::now())
    .bind(terminal_id)
    .execute(pool)
    .await?;

    Ok(next_version)
}

pub async fn delete(pool: &SqlitePool, terminal_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM abstract_terminals WHERE terminal_id = ?")
        .bind(terminal_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_all_for_thread(pool: &SqlitePool, thread_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM abstract_terminals WHERE thread_id = ?")
        .bind(thread_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── terminal_commands (busy predicate log, enforce_idle_timeouts) ──

pub async fn start_command(
    pool: &SqlitePool,
    command_id: &str,
    terminal_id: &str,
    lease_id: &str,
    command: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO terminal_commands (command_id, terminal_id, lease_id, command, status, started_at, finished_at) \
         VALUES (?, ?, ?, ?, 'running', ?, NULL)",
    )
    .bind(command_id)
    .bind(terminal_id)
    .bind(lease_id)
    .bind(command)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finish_command(pool: &SqlitePool, command_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE terminal_commands SET status = ?, finished_at = ? WHERE command_id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(command_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn terminal_is_busy(pool: &SqlitePool, terminal_id: &str) -> Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) as c FROM terminal_commands WHERE terminal_id = ? AND status = 'running'",
    )
    .bind(terminal_id)
    .fetch_one(pool)
    .await?;
    Ok(row.get::<i64, _>("c") > 0)
}

pub async fn lease_is_busy(pool: &SqlitePool, lease_id: &str) -> Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) as c FROM terminal_commands WHERE lease_id = ? AND status = 'running'",
    )
    .bind(lease_id)
    .fetch_one(pool)
    .await?;
    Ok(row.get::<i64, _>("c") > 0)
}
