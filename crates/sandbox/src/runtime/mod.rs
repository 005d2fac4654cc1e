//! `PhysicalTerminalRuntime`: the ephemeral object that owns the
//! live shell process or remote provider session backing one `ChatSession`.
//!
//! This trait is distinct from [`crate::provider::SandboxProvider`]: a
//! provider is the compute backend, a runtime is the terminal-shaped wrapper
//! around it that knows about hydration, markers, and cwd tracking.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use sbx_domain::error::Result;
use std::time::Duration;

pub use local::LocalPersistentShellRuntime;
pub use remote::RemoteWrappedRuntime;

/// Builds the `PhysicalTerminalRuntime` variant `capability.runtime_kind`
/// calls for. Shared by [`crate::manager::SandboxManager`] (new sessions)
/// and background-command forking, which needs a fresh runtime for the
/// forked terminal rather than reusing the default terminal's.
pub fn build_runtime(
    runtime_kind: sbx_domain::capability::RuntimeKind,
    lease_id: &str,
    provider: std::sync::Arc<dyn crate::provider::SandboxProvider>,
    lease_store: std::sync::Arc<crate::lease::LeaseStore>,
    infra_classifier: std::sync::Arc<dyn crate::provider::InfraErrorClassifier>,
) -> std::sync::Arc<dyn PhysicalTerminalRuntime> {
    match runtime_kind {
        sbx_domain::capability::RuntimeKind::LocalShell => std::sync::Arc::new(LocalPersistentShellRuntime::new()),
        sbx_domain::capability::RuntimeKind::RemoteWrapped => {
            std::sync::Arc::new(RemoteWrappedRuntime::new(lease_id.to_string(), provider, lease_store, infra_classifier))
        }
    }
}

/// Result of one `execute` call against a runtime. Distinct from
/// [`crate::provider::ProviderExecResult`] because it also threads back the
/// post-command `pwd` probe the runtime layer owns.
#[derive(Debug, Clone)]
pub struct RuntimeExecResult {
    pub output: String,
    pub exit_code: i32,
    pub timed_out: bool,
    /// `Some(new_cwd)` when the post-command probe observed a cwd change.
    pub new_cwd: Option<String>,
}

#[async_trait]
pub trait PhysicalTerminalRuntime: Send + Sync {
    /// Runs `command` against the live process/session. `cwd` and
    /// `env_delta` are the terminal's current durable snapshot — on first
    /// call (or after a respawn) the runtime hydrates from them before
    /// running the command.
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cwd: &str,
        env_delta: &serde_json::Value,
    ) -> Result<RuntimeExecResult>;

    /// Always safe to call; terminates any owned process/session within a
    /// bounded grace period. Does not destroy the backing lease.
    async fn close(&self) -> Result<()>;
}
