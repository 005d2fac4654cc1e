//! `SandboxManager`: the top-level orchestrator tying leases,
//! terminals, chat sessions, and providers together behind one thread-shaped
//! API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sbx_domain::error::{Error, Result};
use sbx_domain::lifecycle::LeaseObservedState;
use sbx_domain::trace::TraceEvent;
use sqlx::sqlite::SqlitePool;

use crate::config::SandboxEngineConfig;
use crate::lease::{Lease, LeaseEvent, LeaseStore};
use crate::provider::{DefaultInfraErrorClassifier, InfraErrorClassifier, ProviderRegistry, SandboxProvider};
use crate::runtime::PhysicalTerminalRuntime;
use crate::session::{ChatSession, ChatSessionManager};
use crate::terminal::{Terminal, TerminalStore};

const DEFAULT_CWD: &str = "/home/user";

/// Capability handle returned by `get_sandbox`. Thin — it just remembers
/// which lease/terminal/runtime/session back the thread so the caller can
/// issue commands and file operations.
pub struct SandboxHandle {
    pub thread_id: String,
    pub terminal_id: String,
    pub lease_id: String,
    pub chat_session_id: String,
    instance_id: String,
    provider: Arc<dyn SandboxProvider>,
    runtime: Arc<dyn PhysicalTerminalRuntime>,
    terminal_store: Arc<TerminalStore>,
    session_manager: Arc<ChatSessionManager>,
    lease_store: Arc<LeaseStore>,
    infra_classifier: Arc<dyn InfraErrorClassifier>,
}

impl SandboxHandle {
    /// `background=true` forks a new terminal off the handle's default one
    /// (deep-copying its cwd/env snapshot) and runs `command` there on a
    /// freshly built runtime, so the default terminal is free for the next
    /// interactive command. `background=false` runs on the handle's own
    /// terminal/runtime as usual.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        background: bool,
    ) -> Result<crate::runtime::RuntimeExecResult> {
        if background {
            return self.execute_background(command, timeout).await;
        }

        let terminal = self
            .terminal_store
            .get_by_id(&self.terminal_id)
            .await?
            .ok_or_else(|| Error::SchemaInconsistency(format!("terminal {} not found", self.terminal_id)))?;

        let command_id = self.terminal_store.start_command(&self.terminal_id, &self.lease_id, command).await?;
        let result = self.runtime.execute(command, timeout, &terminal.cwd, &terminal.env_delta).await;
        self.terminal_store
            .finish_command(&command_id, if result.is_ok() { "done" } else { "failed" })
            .await?;
        let result = result?;

        if let Some(new_cwd) = &result.new_cwd {
            self.terminal_store.update_state(&self.terminal_id, new_cwd, &terminal.env_delta).await?;
        }
        self.session_manager.touch(&self.chat_session_id).await?;
        Ok(result)
    }

    async fn execute_background(&self, command: &str, timeout: Duration) -> Result<crate::runtime::RuntimeExecResult> {
        let default_terminal = self
            .terminal_store
            .get_by_id(&self.terminal_id)
            .await?
            .ok_or_else(|| Error::SchemaInconsistency(format!("terminal {} not found", self.terminal_id)))?;
        let forked = self.terminal_store.fork_background(&default_terminal, &self.lease_id).await?;
        let runtime = crate::runtime::build_runtime(
            self.provider.capability().runtime_kind,
            &self.lease_id,
            self.provider.clone(),
            self.lease_store.clone(),
            self.infra_classifier.clone(),
        );

        let command_id = self.terminal_store.start_command(&forked.terminal_id, &self.lease_id, command).await?;
        let result = runtime.execute(command, timeout, &forked.cwd, &forked.env_delta).await;
        self.terminal_store
            .finish_command(&command_id, if result.is_ok() { "done" } else { "failed" })
            .await?;
        let result = result?;

        if let Some(new_cwd) = &result.new_cwd {
            self.terminal_store.update_state(&forked.terminal_id, new_cwd, &forked.env_delta).await?;
        }
        self.session_manager.touch(&self.chat_session_id).await?;
        Ok(result)
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.session_manager.touch(&self.chat_session_id).await?;
        self.provider.read_file(&self.instance_id, path).await
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.session_manager.touch(&self.chat_session_id).await?;
        self.provider.write_file(&self.instance_id, path, content).await
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<crate::provider::DirEntry>> {
        self.session_manager.touch(&self.chat_session_id).await?;
        self.provider.list_dir(&self.instance_id, path).await
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub lease_id: String,
    pub thread_id: Option<String>,
    pub provider_name: String,
    pub instance_id: Option<String>,
    pub observed_state: String,
    pub source: String,
}

pub struct SandboxManager {
    pool: SqlitePool,
    config: SandboxEngineConfig,
    registry: ProviderRegistry,
    lease_store: Arc<LeaseStore>,
    terminal_store: Arc<TerminalStore>,
    session_manager: Arc<ChatSessionManager>,
    infra_classifier: Arc<dyn InfraErrorClassifier>,
}

impl SandboxManager {
    pub fn new(pool: SqlitePool, config: SandboxEngineConfig, registry: ProviderRegistry) -> Self {
        let lease_store = Arc::new(LeaseStore::new(pool.clone(), config.lease_freshness_ttl_sec));
        let terminal_store = Arc::new(TerminalStore::new(pool.clone()));
        let session_manager = Arc::new(ChatSessionManager::new(pool.clone()));
        Self {
            pool,
            config,
            registry,
            lease_store,
            terminal_store,
            session_manager,
            infra_classifier: Arc::new(DefaultInfraErrorClassifier),
        }
    }

    fn provider_for(&self, provider_name: &str) -> Result<Arc<dyn SandboxProvider>> {
        self.registry
            .get(provider_name)
            .ok_or_else(|| Error::InputValidation(format!("unknown provider {provider_name}")))
    }

    fn build_runtime(&self, lease_id: &str, provider: Arc<dyn SandboxProvider>) -> Arc<dyn PhysicalTerminalRuntime> {
        crate::runtime::build_runtime(
            provider.capability().runtime_kind,
            lease_id,
            provider,
            self.lease_store.clone(),
            self.infra_classifier.clone(),
        )
    }

    /// Resolves an existing live session, an existing terminal+lease with a
    /// fresh session, or creates all three from scratch. Auto-resumes a
    /// paused session before returning.
    pub async fn get_sandbox(&self, thread_id: &str, provider_name: &str) -> Result<SandboxHandle> {
        if let Some(session) = self.session_manager.get(thread_id).await? {
            let lease_row = sbx_storage::leases::get(&self.pool, &session.lease_id)
                .await?
                .ok_or_else(|| Error::SchemaInconsistency(format!("lease {} not found", session.lease_id)))?;
            let provider = self.provider_for(&lease_row.provider_name)?;
            return self.resume_and_build_handle(thread_id, session, provider).await;
        }

        let terminal = match self.terminal_store.get_default_for_thread(thread_id).await? {
            Some(terminal) => terminal,
            None => {
                let provider = self.provider_for(provider_name)?;
                let lease_id = format!("lease-{}", uuid::Uuid::new_v4());
                self.lease_store.create(&lease_id, provider.name()).await?;
                self.terminal_store.create(thread_id, &lease_id, DEFAULT_CWD).await?
            }
        };

        let provider = self.provider_for(provider_name)?;
        let lease = self.lease_store.ensure_active_instance(&terminal.lease_id, provider.as_ref()).await?;
        let runtime = self.build_runtime(&terminal.lease_id, provider.clone());
        let session = self
            .session_manager
            .create(
                thread_id,
                &terminal.terminal_id,
                &terminal.lease_id,
                runtime.clone(),
                self.config.chat_idle_ttl_sec,
                self.config.chat_max_duration_sec,
            )
            .await?;

        self.to_handle(thread_id, &terminal, &lease, &session, provider, runtime)
    }

    async fn resume_and_build_handle(
        &self,
        thread_id: &str,
        session: ChatSession,
        provider: Arc<dyn SandboxProvider>,
    ) -> Result<SandboxHandle> {
        let lease = self.lease_store.ensure_active_instance(&session.lease_id, provider.as_ref()).await?;
        if session.status == sbx_domain::lifecycle::ChatSessionStatus::Paused {
            self.session_manager.resume(&session.chat_session_id).await?;
        }
        let terminal = self
            .terminal_store
            .get_by_id(&session.terminal_id)
            .await?
            .ok_or_else(|| Error::SchemaInconsistency(format!("terminal {} not found", session.terminal_id)))?;
        let runtime = self
            .session_manager
            .get_runtime(&session.chat_session_id)
            .unwrap_or_else(|| self.build_runtime(&session.lease_id, provider.clone()));
        self.to_handle(thread_id, &terminal, &lease, &session, provider, runtime)
    }

    fn to_handle(
        &self,
        thread_id: &str,
        terminal: &Terminal,
        lease: &Lease,
        session: &ChatSession,
        provider: Arc<dyn SandboxProvider>,
        runtime: Arc<dyn PhysicalTerminalRuntime>,
    ) -> Result<SandboxHandle> {
        let instance_id = lease
            .current_instance_id
            .clone()
            .ok_or_else(|| Error::SchemaInconsistency(format!("lease {} has no bound instance", lease.lease_id)))?;
        Ok(SandboxHandle {
            thread_id: thread_id.to_string(),
            terminal_id: terminal.terminal_id.clone(),
            lease_id: lease.lease_id.clone(),
            chat_session_id: session.chat_session_id.clone(),
            instance_id,
            provider,
            runtime,
            terminal_store: self.terminal_store.clone(),
            session_manager: self.session_manager.clone(),
            lease_store: self.lease_store.clone(),
            infra_classifier: self.infra_classifier.clone(),
        })
    }

    /// `pause_session`/`resume_session` operate on the thread's single
    /// active chat session and its lease.
    pub async fn pause_session(&self, thread_id: &str) -> Result<()> {
        let Some(session) = self.session_manager.get(thread_id).await? else {
            return Err(Error::InputValidation(format!("no active session for thread {thread_id}")));
        };
        let lease_row = sbx_storage::leases::get(&self.pool, &session.lease_id)
            .await?
            .ok_or_else(|| Error::SchemaInconsistency(format!("lease {} not found", session.lease_id)))?;
        let provider = self.provider_for(&lease_row.provider_name)?;

        // Idempotently ensure a bound running instance first, so pausing
        // never operates on a stale detached binding.
        self.lease_store.ensure_active_instance(&session.lease_id, provider.as_ref()).await?;
        self.lease_store
            .apply(&session.lease_id, provider.as_ref(), LeaseEvent::IntentPause, "manager.pause_session")
            .await?;
        self.session_manager.pause(&session.chat_session_id).await
    }

    pub async fn resume_session(&self, thread_id: &str) -> Result<()> {
        let Some(session) = self.session_manager.get(thread_id).await? else {
            return Err(Error::InputValidation(format!("no active session for thread {thread_id}")));
        };
        let lease_row = sbx_storage::leases::get(&self.pool, &session.lease_id)
            .await?
            .ok_or_else(|| Error::SchemaInconsistency(format!("lease {} not found", session.lease_id)))?;
        let provider = self.provider_for(&lease_row.provider_name)?;
        self.lease_store
            .apply(&session.lease_id, provider.as_ref(), LeaseEvent::IntentResume, "manager.resume_session")
            .await?;
        self.session_manager.resume(&session.chat_session_id).await
    }

    pub async fn destroy_session(&self, thread_id: &str, chat_session_id: Option<&str>) -> Result<()> {
        let session = match chat_session_id {
            Some(id) => {
                let row = sbx_storage::chat_sessions::get_by_id(&self.pool, id)
                    .await?
                    .ok_or_else(|| Error::InputValidation(format!("chat session {id} not found")))?;
                if row.thread_id != thread_id {
                    return Err(Error::InputValidation(format!(
                        "chat session {id} does not belong to thread {thread_id}"
                    )));
                }
                ChatSession {
                    chat_session_id: row.chat_session_id,
                    thread_id: row.thread_id,
                    terminal_id: row.terminal_id,
                    lease_id: row.lease_id,
                    status: sbx_domain::lifecycle::ChatSessionStatus::parse(&row.status)?,
                    idle_ttl_sec: row.idle_ttl_sec,
                    max_duration_sec: row.max_duration_sec,
                    started_at: row.started_at,
                    last_active_at: row.last_active_at,
                }
            }
            None => self
                .session_manager
                .get(thread_id)
                .await?
                .ok_or_else(|| Error::InputValidation(format!("no active session for thread {thread_id}")))?,
        };

        let lease_row = sbx_storage::leases::get(&self.pool, &session.lease_id).await?;
        if let Some(lease_row) = lease_row {
            let provider = self.provider_for(&lease_row.provider_name)?;
            self.lease_store
                .apply(&session.lease_id, provider.as_ref(), LeaseEvent::IntentDestroy, "manager.destroy_session")
                .await?;
        }
        self.session_manager.delete(&session.chat_session_id, "destroyed").await
    }

    /// Tears down every resource a thread owns: sessions, terminals, and
    /// any lease no longer referenced by another thread.
    pub async fn destroy_thread_resources(&self, thread_id: &str) -> Result<()> {
        if let Some(session) = self.session_manager.get(thread_id).await? {
            self.session_manager.delete(&session.chat_session_id, "thread_destroyed").await?;
        }

        let terminals = self.terminal_store.list_by_thread(thread_id).await?;
        let mut lease_ids: Vec<String> = terminals.iter().map(|t| t.lease_id.clone()).collect();
        lease_ids.sort();
        lease_ids.dedup();

        for lease_id in &lease_ids {
            if let Some(lease_row) = sbx_storage::leases::get(&self.pool, lease_id).await? {
                if let Ok(provider) = self.provider_for(&lease_row.provider_name) {
                    let _ = self
                        .lease_store
                        .apply(lease_id, provider.as_ref(), LeaseEvent::IntentDestroy, "manager.destroy_thread_resources")
                        .await;
                }
            }
        }

        self.terminal_store.delete_all_for_thread(thread_id).await?;
        sbx_storage::chat_sessions::delete_all_for_thread(&self.pool, thread_id).await?;
        sbx_storage::run_events::delete_all_for_thread(&self.pool, thread_id).await?;

        for lease_id in &lease_ids {
            if !self.lease_store.is_referenced(lease_id).await? {
                self.lease_store.delete(lease_id).await?;
            }
        }
        Ok(())
    }

    /// One row per (lease, thread) pair, plus provider-reported orphans not
    /// bound to any lease.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let leases = sbx_storage::leases::list_all(&self.pool).await?;
        let mut out = Vec::new();

        for lease_row in &leases {
            let observed = LeaseObservedState::parse_lenient(Some(&lease_row.observed_state));
            if observed == LeaseObservedState::Detached {
                continue;
            }
            let terminals = sbx_storage::terminals::list_by_lease(&self.pool, &lease_row.lease_id).await?;
            if terminals.is_empty() {
                out.push(SessionSummary {
                    lease_id: lease_row.lease_id.clone(),
                    thread_id: None,
                    provider_name: lease_row.provider_name.clone(),
                    instance_id: lease_row.current_instance_id.clone(),
                    observed_state: observed.to_string(),
                    source: "lease".into(),
                });
                continue;
            }
            for terminal in terminals {
                out.push(SessionSummary {
                    lease_id: lease_row.lease_id.clone(),
                    thread_id: Some(terminal.thread_id),
                    provider_name: lease_row.provider_name.clone(),
                    instance_id: lease_row.current_instance_id.clone(),
                    observed_state: observed.to_string(),
                    source: "lease".into(),
                });
            }
        }

        for provider in self.registry.iter() {
            if !provider.capability().inspect_visible {
                continue;
            }
            let known: std::collections::HashSet<&str> = leases
                .iter()
                .filter(|l| l.provider_name == provider.name())
                .filter_map(|l| l.current_instance_id.as_deref())
                .collect();
            if let Ok(sessions) = provider.list_provider_sessions().await {
                for session in sessions {
                    if !known.contains(session.session_id.as_str()) {
                        out.push(SessionSummary {
                            lease_id: String::new(),
                            thread_id: None,
                            provider_name: provider.name().to_string(),
                            instance_id: Some(session.session_id),
                            observed_state: session.status,
                            source: "provider_orphan".into(),
                        });
                    }
                }
            }
        }

        Ok(out)
    }

    /// Pauses leases of sessions past their idle/duration
    /// policy, unless their terminal or lease is busy, the lease is shared
    /// by another active session, or the provider cannot pause (including
    /// the local provider, which is never paused).
    pub async fn enforce_idle_timeouts(&self) -> Result<(usize, usize)> {
        let expired = self.session_manager.cleanup_expired().await?;
        let mut checked = 0usize;
        let mut closed = 0usize;
        let mut paused = 0usize;

        for session in expired {
            checked += 1;

            if self.terminal_store.is_busy(&session.terminal_id).await?
                || self.terminal_store.lease_is_busy(&session.lease_id).await?
            {
                continue;
            }

            let shared = sbx_storage::chat_sessions::list_active_by_lease(&self.pool, &session.lease_id)
                .await?
                .iter()
                .any(|row| row.chat_session_id != session.chat_session_id);
            if shared {
                continue;
            }

            let Some(lease_row) = sbx_storage::leases::get(&self.pool, &session.lease_id).await? else {
                continue;
            };
            let Ok(provider) = self.provider_for(&lease_row.provider_name) else {
                continue;
            };

            if provider.capability().can_pause {
                match self
                    .lease_store
                    .apply(&session.lease_id, provider.as_ref(), LeaseEvent::IntentPause, "idle_reaper")
                    .await
                {
                    Ok(_) => {
                        self.session_manager.delete(&session.chat_session_id, "idle_timeout").await?;
                        closed += 1;
                        paused += 1;
                    }
                    Err(_) => continue,
                }
            } else {
                self.session_manager.delete(&session.chat_session_id, "idle_timeout").await?;
                closed += 1;
            }
        }

        TraceEvent::IdleReaperSwept { checked, paused, closed }.emit();
        Ok((checked, closed))
    }

    pub fn lease_store(&self) -> &Arc<LeaseStore> {
        &self.lease_store
    }

    pub fn terminal_store(&self) -> &Arc<TerminalStore> {
        &self.terminal_store
    }

    pub fn session_manager(&self) -> &Arc<ChatSessionManager> {
        &self.session_manager
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::FakeProvider;
    use std::sync::Arc;

    async fn manager() -> SandboxManager {
        let pool = sbx_storage::open_in_memory().await.unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider::new("fake")));
        SandboxManager::new(pool, SandboxEngineConfig::default(), registry)
    }

    #[tokio::test]
    async fn get_sandbox_creates_lease_terminal_and_session_once() {
        let manager = manager().await;
        let handle = manager.get_sandbox("thread-A", "fake").await.unwrap();
        let handle2 = manager.get_sandbox("thread-A", "fake").await.unwrap();

        assert_eq!(handle.lease_id, handle2.lease_id);
        assert_eq!(handle.terminal_id, handle2.terminal_id);

        let leases = sbx_storage::leases::list_all(manager.lease_store().pool()).await.unwrap();
        assert_eq!(leases.len(), 1);
    }

    #[tokio::test]
    async fn pause_then_resume_restores_running() {
        let manager = manager().await;
        manager.get_sandbox("thread-A", "fake").await.unwrap();
        manager.pause_session("thread-A").await.unwrap();

        let sessions = sbx_storage::chat_sessions::list_active(manager.lease_store().pool()).await.unwrap();
        assert_eq!(sessions[0].status, "paused");

        manager.resume_session("thread-A").await.unwrap();
        let sessions = sbx_storage::chat_sessions::list_active(manager.lease_store().pool()).await.unwrap();
        assert_eq!(sessions[0].status, "active");
    }

    #[tokio::test]
    async fn destroy_thread_resources_clears_everything() {
        let manager = manager().await;
        manager.get_sandbox("thread-A", "fake").await.unwrap();
        manager.destroy_thread_resources("thread-A").await.unwrap();

        assert!(manager.terminal_store.list_by_thread("thread-A").await.unwrap().is_empty());
        assert!(sbx_storage::chat_sessions::get_active_for_thread(manager.lease_store().pool(), "thread-A")
            .await
            .unwrap()
            .is_none());
        assert!(sbx_storage::leases::list_all(manager.lease_store().pool()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn background_execute_forks_terminal_and_leaves_default_untouched() {
        let manager = manager().await;
        let handle = manager.get_sandbox("thread-A", "fake").await.unwrap();

        handle.execute("echo fg", Duration::from_secs(5), false).await.unwrap();
        let before = manager.terminal_store().list_by_thread("thread-A").await.unwrap();
        assert_eq!(before.len(), 1);

        handle.execute("sleep 60", Duration::from_secs(5), true).await.unwrap();

        let after = manager.terminal_store().list_by_thread("thread-A").await.unwrap();
        assert_eq!(after.len(), 2);
        let default_terminal = after.iter().find(|t| t.terminal_id == handle.terminal_id).unwrap();
        let forked = after.iter().find(|t| t.terminal_id != handle.terminal_id).unwrap();
        assert!(default_terminal.is_default);
        assert!(!forked.is_default);
        assert_eq!(forked.lease_id, handle.lease_id);
    }
}
