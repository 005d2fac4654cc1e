//! `provider_events` accessor.

use chrono::{DateTime, Utc};
use sbx_domain::error::Result;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ProviderEventRow {
    pub event_id: i64,
    pub provider_name: String,
    pub instance_id: String,
    pub event_type: String,
    pub payload_json: String,
    pub matched_lease_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> ProviderEventRow {
    ProviderEventRow {
        event_id: row.get("event_id"),
        provider_name: row.get("provider_name"),
        instance_id: row.get("instance_id"),
        event_type: row.get("event_type"),
        payload_json: row.get("payload_json"),
        matched_lease_id: row.get("matched_lease_id"),
        created_at: row.get("created_at"),
    }
}

pub async fn append(
    pool: &SqlitePool,
    provider_name: &str,
    instance_id: &str,
    event_type: &str,
    payload_json: &str,
    matched_lease_id: Option<&str>,
) -> Result<i64> {
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO provider_events (provider_name, instance_id, event_type, payload_json, matched_lease_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(provider_name)
    .bind(instance_id)
    .bind(event_type)
    .bind(payload_json)
    .bind(matched_lease_id)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// `GET /webhooks/events?limit=N`, most recent first.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<ProviderEventRow>> {
    let rows = sqlx::query("SELECT * FROM provider_events ORDER BY created_at DESC, event_id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_event).collect())
}
