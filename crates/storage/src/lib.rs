pub mod chat_sessions;
pub mod leases;
pub mod pool;
pub mod provider_events;
pub mod run_events;
pub mod schema;
pub mod terminals;

pub use pool::{open, MIN_BUSY_TIMEOUT};
#[cfg(any(test, feature = "test-util"))]
pub use pool::open_in_memory;

pub use sqlx::sqlite::SqlitePool as Pool;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_creates_and_validates() {
        let pool = open_in_memory().await.unwrap();
        schema::validate_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn missing_column_fails_loudly() {
        let pool = open_in_memory().await.unwrap();
        sqlx::query("ALTER TABLE sandbox_leases RENAME COLUMN observed_state TO moved")
            .execute(&pool)
            .await
            .unwrap();
        let err = schema::validate_schema(&pool).await.unwrap_err();
        assert!(matches!(err, sbx_domain::error::Error::SchemaInconsistency(_)));
    }

    #[tokio::test]
    async fn lease_crud_roundtrip() {
        let pool = open_in_memory().await.unwrap();
        let lease = leases::create(&pool, "lease-1", "local", "running", "detached")
            .await
            .unwrap();
        assert_eq!(lease.version, 0);

        leases::update_snapshot(
            &pool,
            "lease-1",
            Some("inst-1"),
            "running",
            "running",
            1,
            Some(chrono::Utc::now()),
            None,
            false,
            None,
        )
        .await
        .unwrap();

        let fetched = leases::get(&pool, "lease-1").await.unwrap().unwrap();
        assert_eq!(fetched.version, 1);
        assert_eq!(fetched.current_instance_id.as_deref(), Some("inst-1"));
    }

    #[tokio::test]
    async fn chat_session_supersede_closes_prior() {
        let pool = open_in_memory().await.unwrap();
        leases::create(&pool, "lease-1", "local", "running", "running")
            .await
            .unwrap();
        terminals::create(&pool, "term-1", "thread-1", "lease-1", true, "/home/user", "{}")
            .await
            .unwrap();

        let first = chat_sessions::create_superseding(
            &pool, "cs-1", "thread-1", "term-1", "lease-1", None, 300, 86400,
        )
        .await
        .unwrap();
        assert_eq!(first.status, "active");

        chat_sessions::create_superseding(
            &pool, "cs-2", "thread-1", "term-1", "lease-1", None, 300, 86400,
        )
        .await
        .unwrap();

        let old = chat_sessions::get_by_id(&pool, "cs-1").await.unwrap().unwrap();
        assert_eq!(old.status, "closed");
        assert_eq!(old.close_reason.as_deref(), Some("superseded"));

        let active = chat_sessions::get_active_for_thread(&pool, "thread-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.chat_session_id, "cs-2");
    }

    #[tokio::test]
    async fn run_events_seq_monotone_and_cleanup() {
        let pool = open_in_memory().await.unwrap();
        let s1 = run_events::append(&pool, "thread-1", "run-1", "text", "{}", None)
            .await
            .unwrap();
        let s2 = run_events::append(&pool, "thread-1", "run-1", "done", "{}", None)
            .await
            .unwrap();
        assert!(s2 > s1);

        run_events::append(&pool, "thread-1", "run-2", "text", "{}", None)
            .await
            .unwrap();

        let deleted = run_events::cleanup_old_runs(&pool, "thread-1", 1).await.unwrap();
        assert_eq!(deleted, 2);
        let remaining = run_events::list_after(&pool, "thread-1", "run-2", 0).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
