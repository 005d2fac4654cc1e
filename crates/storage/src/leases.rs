//! `sandbox_leases` + `sandbox_instances` + `lease_events` accessors.
//!
//! Thin typed wrappers — no state-machine logic here (that lives in
//! `sbx-sandbox::lease`). This module only knows how to read and write
//! rows.

use chrono::{DateTime, Utc};
use sbx_domain::error::Result;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct LeaseRow {
    pub lease_id: String,
    pub provider_name: String,
    pub current_instance_id: Option<String>,
    pub desired_state: String,
    pub observed_state: String,
    pub version: i64,
    pub observed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub needs_refresh: bool,
    pub refresh_hint_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_lease(row: &sqlx::sqlite::SqliteRow) -> LeaseRow {
    LeaseRow {
        lease_id: row.get("lease_id"),
        provider_name: row.get("provider_name"),
        current_instance_id: row.get("current_instance_id"),
        desired_state: row.get("desired_state"),
        observed_state: row.get("observed_state"),
        version: row.get("version"),
        observed_at: row.get("observed_at"),
        last_error: row.get("last_error"),
        needs_refresh: row.get::<i64, _>("needs_refresh") != 0,
        refresh_hint_at: row.get("refresh_hint_at"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn create(
    pool: &SqlitePool,
    lease_id: &str,
    provider_name: &str,
    desired_state: &str,
    observed_state: &str,
) -> Result<LeaseRow> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sandbox_leases \
         (lease_id, provider_name, current_instance_id, desired_state, observed_state, \
          version, observed_at, last_error, needs_refresh, refresh_hint_at, status, created_at, updated_at) \
         VALUES (?, ?, NULL, ?, ?, 0, ?, NULL, 0, NULL, 'active', ?, ?)",
    )
    .bind(lease_id)
    .bind(provider_name)
    .bind(desired_state)
    .bind(observed_state)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get(pool, lease_id)
        .await?
        .ok_or_else(|| sbx_domain::error::Error::Other("lease vanished after insert".into()))
}

pub async fn get(pool: &SqlitePool, lease_id: &str) -> Result<Option<LeaseRow>> {
    let row = sqlx::query("SELECT * FROM sandbox_leases WHERE lease_id = ?")
        .bind(lease_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_lease))
}

/// Finds the lease currently bound to a provider instance id, for matching
/// inbound webhook events back to a lease. Scoped by `(provider_name,
/// instance_id)` per spec — a session-id collision across two different
/// providers must not match the wrong provider's lease.
pub async fn find_by_current_instance_id(
    pool: &SqlitePool,
    provider_name: &str,
    instance_id: &str,
) -> Result<Option<LeaseRow>> {
    let row = sqlx::query("SELECT * FROM sandbox_leases WHERE provider_name = ? AND current_instance_id = ?")
        .bind(provider_name)
        .bind(instance_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_lease))
}

pub async fn list_by_provider(pool: &SqlitePool, provider_name: &str) -> Result<Vec<LeaseRow>> {
    let rows = sqlx::query("SELECT * FROM sandbox_leases WHERE provider_name = ?")
        .bind(provider_name)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_lease).collect())
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<LeaseRow>> {
    let rows = sqlx::query("SELECT * FROM sandbox_leases")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_lease).collect())
}

pub async fn list_needing_refresh(pool: &SqlitePool, older_than: DateTime<Utc>) -> Result<Vec<LeaseRow>> {
    let rows = sqlx::query(
        "SELECT * FROM sandbox_leases WHERE needs_refresh = 1 \
         AND (refresh_hint_at IS NULL OR refresh_hint_at <= ?)",
    )
    .bind(older_than)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_lease).collect())
}

/// Full snapshot update applied after a successful or failed `apply()`.
#[allow(clippy::too_many_arguments)]
pub async fn update_snapshot(
    pool: &SqlitePool,
    lease_id: &str,
    current_instance_id: Option<&str>,
    desired_state: &str,
    observed_state: &str,
    version: i64,
    observed_at: Option<DateTime<Utc>>,
    last_error: Option<&str>,
    needs_refresh: bool,
    refresh_hint_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sandbox_leases SET current_instance_id = ?, desired_state = ?, observed_state = ?, \
         version = ?, observed_at = ?, last_error = ?, needs_refresh = ?, refresh_hint_at = ?, \
         updated_at = ? WHERE lease_id = ?",
    )
    .bind(current_instance_id)
    .bind(desired_state)
    .bind(observed_state)
    .bind(version)
    .bind(observed_at)
    .bind(last_error)
    .bind(needs_refresh as i64)
    .bind(refresh_hint_at)
    .bind(Utc::now())
    .bind(lease_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_status(pool: &SqlitePool, lease_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE sandbox_leases SET status = ?, updated_at = ? WHERE lease_id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(lease_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, lease_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sandbox_leases WHERE lease_id = ?")
        .bind(lease_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// True if any `abstract_terminals` row still references this lease.
pub async fn is_referenced_by_any_terminal(pool: &SqlitePool, lease_id: &str) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) as c FROM abstract_terminals WHERE lease_id = ?")
        .bind(lease_id)
        .fetch_one(pool)
        .await?;
    Ok(row.get::<i64, _>("c") > 0)
}

// ── sandbox_instances ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InstanceRow {
    pub instance_id: String,
    pub lease_id: String,
    pub provider_session_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> InstanceRow {
    InstanceRow {
        instance_id: row.get("instance_id"),
        lease_id: row.get("lease_id"),
        provider_session_id: row.get("provider_session_id"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        last_seen_at: row.get("last_seen_at"),
    }
}

pub async fn create_instance(
    pool: &SqlitePool,
    instance_id: &str,
    lease_id: &str,
    provider_session_id: Option<&str>,
    status: &str,
) -> Result<InstanceRow> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sandbox_instances (instance_id, lease_id, provider_session_id, status, created_at, last_seen_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(instance_id)
    .bind(lease_id)
    .bind(provider_session_id)
    .bind(status)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(InstanceRow {
        instance_id: instance_id.to_string(),
        lease_id: lease_id.to_string(),
        provider_session_id: provider_session_id.map(str::to_string),
        status: status.to_string(),
        created_at: now,
        last_seen_at: now,
    })
}

pub async fn get_instance(pool: &SqlitePool, instance_id: &str) -> Result<Option<InstanceRow>> {
    let row = sqlx::query("SELECT * FROM sandbox_instances WHERE instance_id = ?")
        .bind(instance_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_instance))
}

pub async fn update_instance_status(pool: &SqlitePool, instance_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE sandbox_instances SET status = ?, last_seen_at = ? WHERE instance_id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_instances_for_lease(pool: &SqlitePool, lease_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sandbox_instances WHERE lease_id = ?")
        .bind(lease_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── lease_events ──────────────────────────────────────────────────────

pub async fn append_event(
    pool: &SqlitePool,
    event_id: &str,
    lease_id: &str,
    event_type: &str,
    source: &str,
    payload_json: &str,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO lease_events (event_id, lease_id, event_type, source, payload_json, error, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event_id)
    .bind(lease_id)
    .bind(event_type)
    .bind(source)
    .bind(payload_json)
    .bind(error)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LeaseEventRow {
    pub event_id: String,
    pub lease_id: String,
    pub event_type: String,
    pub source: String,
    pub payload_json: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn list_events_for_lease(pool: &SqlitePool, lease_id: &str) -> Result<Vec<LeaseEventRow>> {
    let rows = sqlx::query(
        "SELECT * FROM lease_events WHERE lease_id = ? ORDER BY created_at ASC",
    )
    .bind(lease_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| LeaseEventRow {
            event_id: row.get("event_id"),
            lease_id: row.get("lease_id"),
            event_type: row.get("event_type"),
            source: row.get("source"),
            payload_json: row.get("payload_json"),
            error: row.get("error"),
            created_at: row.get("created_at"),
        })
        .collect())
}
