use std::time::Duration;

use sbx_domain::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::sqlite::SqlitePool;

/// Per-connection `busy_timeout` floor: every writer gets WAL mode plus a
/// busy timeout of at least 30s.
pub const MIN_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens (creating if absent) a WAL-mode SQLite database at `path` and runs
/// schema creation + the fail-loud validation pass.
pub async fn open(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(MIN_BUSY_TIMEOUT)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    crate::schema::create_schema(&pool).await?;
    crate::schema::validate_schema(&pool).await?;

    Ok(pool)
}

/// In-memory variant for tests: each call gets an isolated, private
/// in-memory database (not shared across connections).
#[cfg(any(test, feature = "test-util"))]
pub async fn open_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .busy_timeout(MIN_BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    crate::schema::create_schema(&pool).await?;
    crate::schema::validate_schema(&pool).await?;
    Ok(pool)
}
