//! `ChatSessionManager`: the ephemeral layer pairing a durable
//! `ChatSession` row with its live [`PhysicalTerminalRuntime`].
//!
//! The in-memory `live_runtimes` map is the one piece of genuinely global
//! mutable state this crate owns. It is encapsulated on `ChatSessionManager`
//! itself, keyed by `chat_session_id`, rather than left as a module-level
//! global.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use sbx_domain::error::{Error, Result};
use sbx_domain::lifecycle::{assert_chat_session_transition, ChatSessionStatus};
use sbx_domain::trace::TraceEvent;
use sqlx::sqlite::SqlitePool;

use crate::runtime::PhysicalTerminalRuntime;

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub chat_session_id: String,
    pub thread_id: String,
    pub terminal_id: String,
    pub lease_id: String,
    pub status: ChatSessionStatus,
    pub idle_ttl_sec: i64,
    pub max_duration_sec: i64,
    pub started_at: chrono::DateTime<Utc>,
    pub last_active_at: chrono::DateTime<Utc>,
}

impl ChatSession {
    fn from_row(row: &sbx_storage::chat_sessions::ChatSessionRow) -> Result<Self> {
        Ok(Self {
            chat_session_id: row.chat_session_id.clone(),
            thread_id: row.thread_id.clone(),
            terminal_id: row.terminal_id.clone(),
            lease_id: row.lease_id.clone(),
            status: ChatSessionStatus::parse(&row.status)?,
            idle_ttl_sec: row.idle_ttl_sec,
            max_duration_sec: row.max_duration_sec,
            started_at: row.started_at,
            last_active_at: row.last_active_at,
        })
    }

    fn idle_expired(&self, now: chrono::DateTime<Utc>) -> bool {
        (now - self.last_active_at).num_seconds() >= self.idle_ttl_sec
    }

    fn duration_expired(&self, now: chrono::DateTime<Utc>) -> bool {
        (now - self.started_at).num_seconds() >= self.max_duration_sec
    }
}

pub struct ChatSessionManager {
    pool: SqlitePool,
    live_runtimes: Mutex<HashMap<String, Arc<dyn PhysicalTerminalRuntime>>>,
}

impl ChatSessionManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, live_runtimes: Mutex::new(HashMap::new()) }
    }

    /// Returns the thread's single in-flight session, transitioning it to
    /// closed(idle_timeout) first if it has expired.
    pub async fn get(&self, thread_id: &str) -> Result<Option<ChatSession>> {
        let Some(row) = sbx_storage::chat_sessions::get_active_for_thread(&self.pool, thread_id).await? else {
            return Ok(None);
        };
        let session = ChatSession::from_row(&row)?;
        let now = Utc::now();
        if session.status != ChatSessionStatus::Paused
            && (session.idle_expired(now) || session.duration_expired(now))
        {
            self.delete(&session.chat_session_id, "idle_timeout").await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    pub fn get_runtime(&self, chat_session_id: &str) -> Option<Arc<dyn PhysicalTerminalRuntime>> {
        self.live_runtimes.lock().get(chat_session_id).cloned()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        thread_id: &str,
        terminal_id: &str,
        lease_id: &str,
        runtime: Arc<dyn PhysicalTerminalRuntime>,
        idle_ttl_sec: i64,
        max_duration_sec: i64,
    ) -> Result<ChatSession> {
        if let Some(prior) = sbx_storage::chat_sessions::get_active_for_thread(&self.pool, thread_id).await? {
            self.close_runtime(&prior.chat_session_id).await;
        }

        let chat_session_id = format!("cs-{}", uuid::Uuid::new_v4());
        let row = sbx_storage::chat_sessions::create_superseding(
            &self.pool,
            &chat_session_id,
            thread_id,
            terminal_id,
            lease_id,
            None,
            idle_ttl_sec,
            max_duration_sec,
        )
        .await?;

        self.live_runtimes.lock().insert(chat_session_id.clone(), runtime);

        TraceEvent::ChatSessionTransition {
            chat_session_id: chat_session_id.clone(),
            thread_id: thread_id.to_string(),
            from: "<new>".into(),
            to: "active".into(),
            reason: "create".into(),
        }
        .emit();

        ChatSession::from_row(&row)
    }

    /// `idle -> active` or `active -> active`; paused sessions are left
    /// untouched.
    pub async fn touch(&self, chat_session_id: &str) -> Result<()> {
        let Some(row) = sbx_storage::chat_sessions::get_by_id(&self.pool, chat_session_id).await? else {
            return Err(Error::SchemaInconsistency(format!("chat session {chat_session_id} not found")));
        };
        let current = ChatSessionStatus::parse(&row.status)?;
        if current == ChatSessionStatus::Paused {
            return Ok(());
        }
        assert_chat_session_transition(Some(current), ChatSessionStatus::Active, "touch")?;
        sbx_storage::chat_sessions::touch(&self.pool, chat_session_id, "active").await
    }

    pub async fn pause(&self, chat_session_id: &str) -> Result<()> {
        self.transition(chat_session_id, ChatSessionStatus::Paused, "pause").await
    }

    pub async fn resume(&self, chat_session_id: &str) -> Result<()> {
        self.transition(chat_session_id, ChatSessionStatus::Active, "resume").await
    }

    async fn transition(&self, chat_session_id: &str, target: ChatSessionStatus, reason: &str) -> Result<()> {
        let Some(row) = sbx_storage::chat_sessions::get_by_id(&self.pool, chat_session_id).await? else {
            return Err(Error::SchemaInconsistency(format!("chat session {chat_session_id} not found")));
        };
        let current = ChatSessionStatus::parse(&row.status)?;
        assert_chat_session_transition(Some(current), target, reason)?;
        sbx_storage::chat_sessions::set_status(&self.pool, chat_session_id, &target.to_string()).await?;

        TraceEvent::ChatSessionTransition {
            chat_session_id: chat_session_id.to_string(),
            thread_id: row.thread_id,
            from: current.to_string(),
            to: target.to_string(),
            reason: reason.to_string(),
        }
        .emit();
        Ok(())
    }

    pub async fn delete(&self, chat_session_id: &str, reason: &str) -> Result<()> {
        self.close_runtime(chat_session_id).await;
        sbx_storage::chat_sessions::close(&self.pool, chat_session_id, reason).await?;

        TraceEvent::ChatSessionTransition {
            chat_session_id: chat_session_id.to_string(),
            thread_id: String::new(),
            from: "*".into(),
            to: "closed".into(),
            reason: reason.to_string(),
        }
        .emit();
        Ok(())
    }

    async fn close_runtime(&self, chat_session_id: &str) {
        let runtime = self.live_runtimes.lock().remove(chat_session_id);
        if let Some(runtime) = runtime {
            let _ = runtime.close().await;
        }
    }

    /// Closes every active/idle/paused session past its idle or duration
    /// policy. Returns the number closed. Busy/shared-lease exemptions live
    /// in [`crate::manager::SandboxManager::enforce_idle_timeouts`], which
    /// calls this only after deciding a session is eligible.
    pub async fn cleanup_expired(&self) -> Result<Vec<ChatSession>> {
        let rows = sbx_storage::chat_sessions::list_active(&self.pool).await?;
        let now = Utc::now();
        let mut expired = Vec::new();
        for row in rows {
            let session = ChatSession::from_row(&row)?;
            if session.status != ChatSessionStatus::Paused
                && (session.idle_expired(now) || session.duration_expired(now))
            {
                expired.push(session);
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::FakeProvider;
    use crate::runtime::RemoteWrappedRuntime;
    use std::time::Duration as StdDuration;

    async fn setup() -> (SqlitePool, ChatSessionManager) {
        let pool = sbx_storage::open_in_memory().await.unwrap();
        sbx_storage::leases::create(&pool, "lease-1", "fake", "running", "running").await.unwrap();
        sbx_storage::terminals::create(&pool, "term-1", "thread-1", "lease-1", true, "/home/user", "{}")
            .await
            .unwrap();
        let manager = ChatSessionManager::new(pool.clone());
        (pool, manager)
    }

    fn fake_runtime() -> Arc<dyn PhysicalTerminalRuntime> {
        let provider = Arc::new(FakeProvider::new("fake"));
        let lease_store = Arc::new(crate::lease::LeaseStore::new(
            sbx_storage::Pool::connect_lazy("sqlite::memory:").unwrap(),
            3,
        ));
        Arc::new(RemoteWrappedRuntime::new(
            "lease-1".into(),
            provider,
            lease_store,
            Arc::new(crate::provider::DefaultInfraErrorClassifier),
        ))
    }

    #[tokio::test]
    async fn create_supersedes_prior_and_closes_its_runtime() {
        let (_pool, manager) = setup().await;
        let first = manager
            .create("thread-1", "term-1", "lease-1", fake_runtime(), 300, 86400)
            .await
            .unwrap();
        assert_eq!(first.status, ChatSessionStatus::Active);
        assert!(manager.get_runtime(&first.chat_session_id).is_some());

        let second = manager
            .create("thread-1", "term-1", "lease-1", fake_runtime(), 300, 86400)
            .await
            .unwrap();
        assert!(manager.get_runtime(&first.chat_session_id).is_none());
        assert!(manager.get_runtime(&second.chat_session_id).is_some());
    }

    #[tokio::test]
    async fn pause_blocks_touch_noop() {
        let (_pool, manager) = setup().await;
        let session = manager
            .create("thread-1", "term-1", "lease-1", fake_runtime(), 300, 86400)
            .await
            .unwrap();
        manager.pause(&session.chat_session_id).await.unwrap();
        manager.touch(&session.chat_session_id).await.unwrap();

        let fetched = sbx_storage::chat_sessions::get_by_id(&_pool, &session.chat_session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, "paused");
    }

    #[tokio::test]
    async fn get_expires_idle_session() {
        let (pool, manager) = setup().await;
        let session = manager
            .create("thread-1", "term-1", "lease-1", fake_runtime(), 0, 86400)
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(1100)).await;
        let result = manager.get("thread-1").await.unwrap();
        assert!(result.is_none());

        let row = sbx_storage::chat_sessions::get_by_id(&pool, &session.chat_session_id).await.unwrap().unwrap();
        assert_eq!(row.status, "closed");
    }
}
