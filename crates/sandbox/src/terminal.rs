//! `TerminalStore`: business logic over `abstract_terminals`.
//!
//! An `AbstractTerminal` is a durable cwd/env snapshot; it is mutated only
//! by a `PhysicalTerminalRuntime` after a command completes, never
//! concurrently — callers serialize through the owning `ChatSession`'s
//! per-thread lock, not through anything in this module.

use sbx_domain::error::{Error, Result};
use sbx_domain::trace::TraceEvent;
use sqlx::sqlite::SqlitePool;

#[derive(Debug, Clone)]
pub struct Terminal {
    pub terminal_id: String,
    pub thread_id: String,
    pub lease_id: String,
    pub is_default: bool,
    pub cwd: String,
    pub env_delta: serde_json::Value,
    pub state_version: i64,
}

impl Terminal {
    fn from_row(row: &sbx_storage::terminals::TerminalRow) -> Result<Self> {
        Ok(Self {
            terminal_id: row.terminal_id.clone(),
            thread_id: row.thread_id.clone(),
            lease_id: row.lease_id.clone(),
            is_default: row.is_default,
            cwd: row.cwd.clone(),
            env_delta: serde_json::from_str(&row.env_delta_json)?,
            state_version: row.state_version,
        })
    }
}

pub struct TerminalStore {
    pool: SqlitePool,
}

impl TerminalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, terminal_id: &str) -> Result<Option<Terminal>> {
        match sbx_storage::terminals::get_by_id(&self.pool, terminal_id).await? {
            Some(row) => Ok(Some(Terminal::from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_default_for_thread(&self, thread_id: &str) -> Result<Option<Terminal>> {
        match sbx_storage::terminals::get_default_by_thread(&self.pool, thread_id).await? {
            Some(row) => Ok(Some(Terminal::from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Terminal>> {
        let rows = sbx_storage::terminals::list_by_thread(&self.pool, thread_id).await?;
        rows.iter().map(Terminal::from_row).collect()
    }

    /// Creates a terminal bound to `lease_id`. The first terminal created
    /// for a thread becomes its default; additional terminals
    /// are explicit multi-terminal-per-thread support, resolved in favor of
    /// a multi-terminal-per-thread model over a single-terminal-per-thread schema (see
    /// this file's own notes on the tradeoff).
    pub async fn create(&self, thread_id: &str, lease_id: &str, cwd: &str) -> Result<Terminal> {
        let existing = sbx_storage::terminals::list_by_thread(&self.pool, thread_id).await?;
        let is_default = existing.is_empty();
        let terminal_id = format!("term-{}", uuid::Uuid::new_v4());
        let row = sbx_storage::terminals::create(&self.pool, &terminal_id, thread_id, lease_id, is_default, cwd, "{}").await?;
        Terminal::from_row(&row)
    }

    /// Forks a new terminal from `source`, deep-copying its cwd/env
    /// snapshot, for a backgrounded command that must keep running against
    /// its own runtime while the foreground terminal is freed up for the
    /// next interactive command.
    pub async fn fork_background(&self, source: &Terminal, lease_id: &str) -> Result<Terminal> {
        let terminal_id = format!("term-{}", uuid::Uuid::new_v4());
        let row = sbx_storage::terminals::create(
            &self.pool,
            &terminal_id,
            &source.thread_id,
            lease_id,
            false,
            &source.cwd,
            &source.env_delta.to_string(),
        )
        .await?;
        Terminal::from_row(&row)
    }

    /// Persists a cwd/env mutation after a command completes and bumps
    /// `state_version`. Returns the updated terminal.
    pub async fn update_state(&self, terminal_id: &str, cwd: &str, env_delta: &serde_json::Value) -> Result<Terminal> {
        let env_delta_json = serde_json::to_string(env_delta)?;
        let new_version = sbx_storage::terminals::update_state(&self.pool, terminal_id, cwd, &env_delta_json).await?;

        TraceEvent::TerminalStateUpdated {
            terminal_id: terminal_id.to_string(),
            state_version: new_version,
        }
        .emit();

        self.get_by_id(terminal_id)
            .await?
            .ok_or_else(|| Error::SchemaInconsistency(format!("terminal {terminal_id} vanished")))
    }

    pub async fn is_busy(&self, terminal_id: &str) -> Result<bool> {
        sbx_storage::terminals::terminal_is_busy(&self.pool, terminal_id).await
    }

    pub async fn lease_is_busy(&self, lease_id: &str) -> Result<bool> {
        sbx_storage::terminals::lease_is_busy(&self.pool, lease_id).await
    }

    pub async fn start_command(&self, terminal_id: &str, lease_id: &str, command: &str) -> Result<String> {
        let command_id = format!("cmd-{}", uuid::Uuid::new_v4());
        sbx_storage::terminals::start_command(&self.pool, &command_id, terminal_id, lease_id, command).await?;
        Ok(command_id)
    }

    pub async fn finish_command(&self, command_id: &str, status: &str) -> Result<()> {
        sbx_storage::terminals::finish_command(&self.pool, command_id, status).await
    }

    pub async fn delete(&self, terminal_id: &str) -> Result<()> {
        sbx_storage::terminals::delete(&self.pool, terminal_id).await
    }

    pub async fn delete_all_for_thread(&self, thread_id: &str) -> Result<()> {
        sbx_storage::terminals::delete_all_for_thread(&self.pool, thread_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TerminalStore {
        let pool = sbx_storage::open_in_memory().await.unwrap();
        sbx_storage::leases::create(&pool, "lease-1", "local", "running", "running").await.unwrap();
        TerminalStore::new(pool)
    }

    #[tokio::test]
    async fn first_terminal_for_thread_is_default() {
        let store = store().await;
        let t = store.create("thread-1", "lease-1", "/home/user").await.unwrap();
        assert!(t.is_default);

        let t2 = store.create("thread-1", "lease-1", "/tmp").await.unwrap();
        assert!(!t2.is_default);
    }

    #[tokio::test]
    async fn fork_background_copies_cwd_and_env() {
        let store = store().await;
        let source = store.create("thread-1", "lease-1", "/home/user").await.unwrap();
        let source = store
            .update_state(&source.terminal_id, "/home/user/project", &serde_json::json!({"FOO": "bar"}))
            .await
            .unwrap();

        let forked = store.fork_background(&source, "lease-1").await.unwrap();
        assert_eq!(forked.cwd, "/home/user/project");
        assert_eq!(forked.env_delta, serde_json::json!({"FOO": "bar"}));
        assert!(!forked.is_default);
        assert_ne!(forked.terminal_id, source.terminal_id);
    }

    #[tokio::test]
    async fn update_state_bumps_version() {
        let store = store().await;
        let t = store.create("thread-1", "lease-1", "/home/user").await.unwrap();
        assert_eq!(t.state_version, 0);
        let updated = store.update_state(&t.terminal_id, "/tmp", &serde_json::json!({})).await.unwrap();
        assert_eq!(updated.state_version, 1);
    }

    #[tokio::test]
    async fn busy_predicate_tracks_running_commands() {
        let store = store().await;
        let t = store.create("thread-1", "lease-1", "/home/user").await.unwrap();
        assert!(!store.is_busy(&t.terminal_id).await.unwrap());

        let cmd_id = store.start_command(&t.terminal_id, "lease-1", "sleep 1").await.unwrap();
        assert!(store.is_busy(&t.terminal_id).await.unwrap());
        assert!(store.lease_is_busy("lease-1").await.unwrap());

        store.finish_command(&cmd_id, "done").await.unwrap();
        assert!(!store.is_busy(&t.terminal_id).await.unwrap());
    }
}
