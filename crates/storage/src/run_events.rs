//! `run_events` accessor.

use chrono::{DateTime, Utc};
use sbx_domain::error::Result;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct RunEventRow {
    pub seq: i64,
    pub thread_id: String,
    pub run_id: String,
    pub event_type: String,
    pub data_json: String,
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> RunEventRow {
    RunEventRow {
        seq: row.get("seq"),
        thread_id: row.get("thread_id"),
        run_id: row.get("run_id"),
        event_type: row.get("event_type"),
        data_json: row.get("data_json"),
        message_id: row.get("message_id"),
        created_at: row.get("created_at"),
    }
}

/// Appends one event and returns the DB-issued monotone `seq` — the
/// client-visible resume cursor (emission contract: persistence
/// happens before the event is visible to any consumer).
pub async fn append(
    pool: &SqlitePool,
    thread_id: &str,
    run_id: &str,
    event_type: &str,
    data_json: &str,
    message_id: Option<&str>,
) -> Result<i64> {
    let seq = sqlx::query(
        "INSERT INTO run_events (thread_id, run_id, event_type, data_json, message_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(thread_id)
    .bind(run_id)
    .bind(event_type)
    .bind(data_json)
    .bind(message_id)
    .bind(Utc::now())
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(seq)
}

pub async fn list_after(pool: &SqlitePool, thread_id: &str, run_id: &str, after_seq: i64) -> Result<Vec<RunEventRow>> {
    let rows = sqlx::query(
        "SELECT * FROM run_events WHERE thread_id = ? AND run_id = ? AND seq > ? ORDER BY seq ASC",
    )
    .bind(thread_id)
    .bind(run_id)
    .bind(after_seq)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_event).collect())
}

/// Distinct `run_id`s for a thread, most-recently-created first.
pub async fn distinct_run_ids_newest_first(pool: &SqlitePool, thread_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT run_id, MAX(created_at) as last_seen FROM run_events WHERE thread_id = ? \
         GROUP BY run_id ORDER BY last_seen DESC",
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("run_id")).collect())
}

/// Deletes events for every run on `thread_id` except the `keep_latest`
/// most-recently-active ones.
pub async fn cleanup_old_runs(pool: &SqlitePool, thread_id: &str, keep_latest: i64) -> Result<u64> {
    let ordered = distinct_run_ids_newest_first(pool, thread_id).await?;
    let keep_latest = keep_latest.max(0) as usize;
    let stale: Vec<&String> = ordered.iter().skip(keep_latest).collect();
    if stale.is_empty() {
        return Ok(0);
    }
    let mut deleted = 0u64;
    for run_id in stale {
        let result = sqlx::query("DELETE FROM run_events WHERE thread_id = ? AND run_id = ?")
            .bind(thread_id)
            .bind(run_id)
            .execute(pool)
            .await?;
        deleted += result.rows_affected();
    }
    Ok(deleted)
}

pub async fn delete_all_for_thread(pool: &SqlitePool, thread_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM run_events WHERE thread_id = ?")
        .bind(thread_id)
        .execute(pool)
        .await?;
    Ok(())
}
