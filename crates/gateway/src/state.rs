use std::sync::Arc;

use sbx_sandbox::SandboxManager;
use sbx_storage::Pool;

use crate::config::GatewayConfig;
use crate::runtime::registry::RunRegistry;
use crate::runtime::session_lock::SessionLockMap;

/// Shared application state passed to every API handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub pool: Pool,
    pub sandbox: Arc<SandboxManager>,

    /// Per-thread run serialization (C10): at most one in-flight run per
    /// thread id.
    pub thread_locks: Arc<SessionLockMap>,
    /// Live run buffers, cancellation tokens, and per-thread current-run
    /// bookkeeping (C8/C9/C10).
    pub run_registry: Arc<RunRegistry>,

    /// SHA-256 hash of the API bearer token, read once at startup.
    /// `None` means dev mode — no auth enforced.
    pub api_token_hash: Option<Vec<u8>>,
}
