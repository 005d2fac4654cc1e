//! Boot-time wiring: turning a loaded [`GatewayConfig`] into a running
//! [`AppState`] plus the background loops that keep leases, runs, and the
//! idle reaper moving without a request in flight.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use sbx_sandbox::local_provider::LocalProvider;
use sbx_sandbox::provider::ProviderRegistry;
use sbx_sandbox::SandboxManager;

use crate::config::GatewayConfig;
use crate::reconcile;
use crate::runtime::registry::RunRegistry;
use crate::runtime::session_lock::SessionLockMap;
use crate::state::AppState;

/// Opens the database, assembles the provider registry, and constructs the
/// shared [`AppState`]. Does not spawn anything — call
/// [`spawn_background_tasks`] separately once the state is built.
pub async fn build_app_state(config: GatewayConfig) -> anyhow::Result<AppState> {
    let pool: sbx_storage::Pool = sbx_storage::open(&config.server.database_path).await?;

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(LocalProvider::new(local_provider_root())));

    let sandbox = Arc::new(SandboxManager::new(pool.clone(), config.engine.clone(), registry));

    let api_token_hash = std::env::var(&config.server.api_token_env).ok().filter(|v| !v.is_empty()).map(|token| {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hasher.finalize().to_vec()
    });
    if api_token_hash.is_none() {
        tracing::warn!(env = %config.server.api_token_env, "no API token set — running without auth");
    }

    Ok(AppState {
        config: Arc::new(config),
        pool,
        sandbox,
        thread_locks: Arc::new(SessionLockMap::new()),
        run_registry: Arc::new(RunRegistry::new()),
        api_token_hash,
    })
}

fn local_provider_root() -> std::path::PathBuf {
    std::env::var("SBX_LOCAL_PROVIDER_ROOT")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("./data/local-sessions"))
}

/// Spawns the three sweeps that keep the system healthy without a live
/// request: provider-event reconciliation (C7), idle reaping (C6), and
/// finished-run buffer cleanup (C8/C9).
pub fn spawn_background_tasks(state: Arc<AppState>) {
    reconcile::spawn_reconcile_loop(
        state.clone(),
        Duration::from_secs(state.config.webhooks.reconcile_interval_sec),
        state.config.webhooks.refresh_stale_after_sec,
    );

    let idle_state = state.clone();
    let idle_interval = Duration::from_secs(state.config.engine.idle_reaper_interval_sec);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(idle_interval);
        loop {
            ticker.tick().await;
            match idle_state.sandbox.enforce_idle_timeouts().await {
                Ok((checked, closed)) => {
                    if checked > 0 || closed > 0 {
                        tracing::info!(checked, closed, "idle reaper swept leases/sessions");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "idle reaper sweep failed"),
            }
        }
    });

    let run_state = state.clone();
    let keepalive = Duration::from_secs(state.config.engine.run_buffer_keepalive_sec.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            run_state.run_registry.sweep_finished(keepalive);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_app_state_registers_local_provider() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sandbox.db");

        let mut config = GatewayConfig::default();
        config.server.database_path = db_path.to_string_lossy().to_string();

        let state = build_app_state(config).await.unwrap();
        assert!(state.sandbox.registry().get("local").is_some());
        assert!(state.api_token_hash.is_none());
    }
}
