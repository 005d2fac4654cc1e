//! Abstract sandbox provider interface.
//!
//! Concrete providers (e2b, daytona, docker, a bare-metal local shell) live
//! outside this crate's scope — it speaks only to this trait.

use async_trait::async_trait;
use sbx_domain::error::Result;
use sbx_domain::ProviderCapability;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub provider: String,
    pub status: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ProviderExecResult {
    pub output: String,
    pub exit_code: i32,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl ProviderExecResult {
    pub fn timed_out() -> Self {
        Self {
            output: String::new(),
            exit_code: -1,
            error: Some("timed out".into()),
            timed_out: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProviderMetrics {
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
}

/// Whether a provider-raised error is a transient infra failure (eligible
/// for exactly one retry) or a genuine application-level failure. This is
/// deliberately a predicate, not a hardcoded regex, so callers can swap it
/// per-provider.
pub trait InfraErrorClassifier: Send + Sync {
    fn is_infra_error(&self, message: &str) -> bool;
}

/// Default classifier: matches a small allowlist of substrings commonly
/// seen in transient provider failures ("no close frame", "session not
/// found", "connection reset", "broken pipe").
pub struct DefaultInfraErrorClassifier;

impl InfraErrorClassifier for DefaultInfraErrorClassifier {
    fn is_infra_error(&self, message: &str) -> bool {
        const NEEDLES: &[&str] = &[
            "no close frame",
            "session not found",
            "connection reset",
            "broken pipe",
            "connection refused",
            "timed out waiting for connection",
        ];
        let lowered = message.to_ascii_lowercase();
        NEEDLES.iter().any(|n| lowered.contains(n))
    }
}

/// Uniform contract over heterogeneous compute backends.
///
/// Implementations must not assume behaviors their [`ProviderCapability`]
/// doesn't declare — callers check capability before calling the
/// corresponding method.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> ProviderCapability;

    async fn create_session(&self, context_id: Option<&str>) -> Result<SessionInfo>;

    async fn destroy_session(&self, session_id: &str) -> Result<bool>;

    async fn pause_session(&self, session_id: &str) -> Result<bool>;

    async fn resume_session(&self, session_id: &str) -> Result<bool>;

    /// Raw provider status string (to be normalized by
    /// [`sbx_domain::LeaseObservedState::parse_lenient`]).
    async fn get_session_status(&self, session_id: &str) -> Result<String>;

    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout_ms: u64,
        cwd: Option<&str>,
    ) -> Result<ProviderExecResult>;

    async fn read_file(&self, session_id: &str, path: &str) -> Result<String>;

    async fn write_file(&self, session_id: &str, path: &str, content: &str) -> Result<()>;

    async fn list_dir(&self, session_id: &str, path: &str) -> Result<Vec<DirEntry>>;

    async fn get_metrics(&self, _session_id: &str) -> Result<Option<ProviderMetrics>> {
        Ok(None)
    }

    /// Orphan discovery: sessions the provider knows about that may no
    /// longer be referenced by any lease. Only meaningful when
    /// `capability().inspect_visible`.
    async fn list_provider_sessions(&self) -> Result<Vec<SessionInfo>> {
        Ok(Vec::new())
    }
}

/// Lookup map `provider_name -> provider`, the single source of dynamic
/// dispatch the manager and lease layers use: avoids
/// isinstance-style checks on concrete provider types.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, std::sync::Arc<dyn SandboxProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: std::sync::Arc<dyn SandboxProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<dyn SandboxProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<dyn SandboxProvider>> {
        self.providers.values()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod tests {
    use super::*;
    use sbx_domain::capability::RuntimeKind;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory provider test double, shaped the way this workspace's
    /// other fakes (e.g. `tools::exec` tests) stub a narrow external
    /// dependency instead of a real process.
    pub struct FakeProvider {
        name: String,
        can_pause: bool,
        supports_status_probe: bool,
        create_calls: AtomicU64,
        sessions: parking_lot::Mutex<std::collections::HashMap<String, String>>,
    }

    impl FakeProvider {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                can_pause: true,
                supports_status_probe: false,
                create_calls: AtomicU64::new(0),
                sessions: parking_lot::Mutex::new(std::collections::HashMap::new()),
            }
        }

        pub fn without_pause(mut self) -> Self {
            self.can_pause = false;
            self
        }

        pub fn with_status_probe(mut self) -> Self {
            self.supports_status_probe = true;
            self
        }

        pub fn create_calls(&self) -> u64 {
            self.create_calls.load(Ordering::SeqCst)
        }

        /// Forces the session's tracked status, for exercising
        /// `get_session_status`-driven probe paths.
        pub fn set_status(&self, session_id: &str, status: &str) {
            if let Some(entry) = self.sessions.lock().get_mut(session_id) {
                *entry = status.to_string();
            }
        }
    }

    #[async_trait]
    impl SandboxProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn capability(&self) -> ProviderCapability {
            ProviderCapability {
                can_pause: self.can_pause,
                can_resume: self.can_pause,
                can_destroy: true,
                supports_webhook: true,
                supports_status_probe: self.supports_status_probe,
                eager_instance_binding: true,
                inspect_visible: false,
                runtime_kind: RuntimeKind::RemoteWrapped,
            }
        }

        async fn create_session(&self, _context_id: Option<&str>) -> Result<SessionInfo> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let id = format!("sess-{}", uuid::Uuid::new_v4());
            self.sessions.lock().insert(id.clone(), "running".to_string());
            Ok(SessionInfo {
                session_id: id,
                provider: self.name.clone(),
                status: "running".into(),
                metadata: HashMap::new(),
            })
        }

        async fn destroy_session(&self, session_id: &str) -> Result<bool> {
            Ok(self.sessions.lock().remove(session_id).is_some())
        }

        async fn pause_session(&self, session_id: &str) -> Result<bool> {
            if let Some(status) = self.sessions.lock().get_mut(session_id) {
                *status = "paused".into();
            }
            Ok(true)
        }

        async fn resume_session(&self, session_id: &str) -> Result<bool> {
            if let Some(status) = self.sessions.lock().get_mut(session_id) {
                *status = "running".into();
            }
            Ok(true)
        }

        async fn get_session_status(&self, session_id: &str) -> Result<String> {
            Ok(self
                .sessions
                .lock()
                .get(session_id)
                .cloned()
                .unwrap_or_else(|| "detached".into()))
        }

        async fn execute(
            &self,
            _session_id: &str,
            command: &str,
            _timeout_ms: u64,
            _cwd: Option<&str>,
        ) -> Result<ProviderExecResult> {
            Ok(ProviderExecResult {
                output: format!("ran: {command}"),
                exit_code: 0,
                error: None,
                timed_out: false,
            })
        }

        async fn read_file(&self, _session_id: &str, _path: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn write_file(&self, _session_id: &str, _path: &str, _content: &str) -> Result<()> {
            Ok(())
        }

        async fn list_dir(&self, _session_id: &str, _path: &str) -> Result<Vec<DirEntry>> {
            Ok(Vec::new())
        }
    }
}
