//! `chat_sessions` accessor.
//!
//! The one-active-session-per-thread invariant is enforced both here, by
//! superseding in the same connection before inserting, and at the schema
//! level by the partial unique index — belt and suspenders, so the
//! invariant holds even under concurrent writers.

use chrono::{DateTime, Utc};
use sbx_domain::error::Result;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ChatSessionRow {
    pub chat_session_id: String,
    pub thread_id: String,
    pub terminal_id: String,
    pub lease_id: String,
    pub runtime_id: Option<String>,
    pub status: String,
    pub idle_ttl_sec: i64,
    pub max_duration_sec: i64,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> ChatSessionRow {
    ChatSessionRow {
        chat_session_id: row.get("chat_session_id"),
        thread_id: row.get("thread_id"),
        terminal_id: row.get("terminal_id"),
        lease_id: row.get("lease_id"),
        runtime_id: row.get("runtime_id"),
        status: row.get("status"),
        idle_ttl_sec: row.get("idle_ttl_sec"),
        max_duration_sec: row.get("max_duration_sec"),
        started_at: row.get("started_at"),
        last_active_at: row.get("last_active_at"),
        ended_at: row.get("ended_at"),
        close_reason: row.get("close_reason"),
    }
}

pub async fn get_active_for_thread(pool: &SqlitePool, thread_id: &str) -> Result<Option<ChatSessionRow>> {
    let row = sqlx::query(
        "SELECT * FROM chat_sessions WHERE thread_id = ? AND status IN ('active', 'idle', 'paused') LIMIT 1",
    )
    .bind(thread_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_session))
}

pub async fn get_by_id(pool: &SqlitePool, chat_session_id: &str) -> Result<Option<ChatSessionRow>> {
    let row = sqlx::query("SELECT * FROM chat_sessions WHERE chat_session_id = ?")
        .bind(chat_session_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_session))
}

/// Supersedes any existing active/idle/paused session for the thread (closed
/// with reason `superseded`), then inserts the new row, all within one
/// transaction.
#[allow(clippy::too_many_arguments)]
pub async fn create_superseding(
    pool: &SqlitePool,
    chat_session_id: &str,
    thread_id: &str,
    terminal_id: &str,
    lease_id: &str,
    runtime_id: Option<&str>,
    idle_ttl_sec: i64,
    max_duration_sec: i64,
) -> Result<ChatSessionRow> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    sqlx::query(
        "UPDATE chat_sessions SET status = 'closed', ended_at = ?, close_reason = 'superseded' \
         WHERE thread_id = ? AND status IN ('active', 'idle', 'paused')",
    )
    .bind(now)
    .bind(thread_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO chat_sessions \
         (chat_session_id, thread_id, terminal_id, lease_id, runtime_id, status, idle_ttl_sec, \
          max_duration_sec, started_at, last_active_at, ended_at, close_reason) \
         VALUES (?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, NULL, NULL)",
    )
    .bind(chat_session_id)
    .bind(thread_id)
    .bind(terminal_id)
    .bind(lease_id)
    .bind(runtime_id)
    .bind(idle_ttl_sec)
    .bind(max_duration_sec)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(ChatSessionRow {
        chat_session_id: chat_session_id.to_string(),
        thread_id: thread_id.to_string(),
        terminal_id: terminal_id.to_string(),
        lease_id: lease_id.to_string(),
        runtime_id: runtime_id.map(str::to_string),
        status: "active".into(),
        idle_ttl_sec,
        max_duration_sec,
        started_at: now,
        last_active_at: now,
        ended_at: None,
        close_reason: None,
    })
}

pub async fn touch(pool: &SqlitePool, chat_session_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE chat_sessions SET status = ?, last_active_at = ? WHERE chat_session_id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(chat_session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_status(pool: &SqlitePool, chat_session_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE chat_sessions SET status = ? WHERE chat_session_id = ?")
        .bind(status)
        .bind(chat_session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn close(pool: &SqlitePool, chat_session_id: &str, reason: &str) -> Result<()> {
    sqlx::query(
        "UPDATE chat_sessions SET status = 'closed', ended_at = ?, close_reason = ? WHERE chat_session_id = ?",
    )
    .bind(Utc::now())
    .bind(reason)
    .bind(chat_session_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_active_by_lease(pool: &SqlitePool, lease_id: &str) -> Result<Vec<ChatSessionRow>> {
    let rows = sqlx::query(
        "SELECT * FROM chat_sessions WHERE lease_id = ? AND status IN ('active', 'idle', 'paused')",
    )
    .bind(lease_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_session).collect())
}

pub async fn list_active(pool: &SqlitePool) -> Result<Vec<ChatSessionRow>> {
    let rows = sqlx::query("SELECT * FROM chat_sessions WHERE status IN ('active', 'idle', 'paused')")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_session).collect())
}

pub async fn delete_all_for_thread(pool: &SqlitePool, thread_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM chat_sessions WHERE thread_id = ?")
        .bind(thread_id)
        .execute(pool)
        .await?;
    Ok(())
}
