//! `RemoteWrappedRuntime`: delegates every command to `provider.execute`,
//! classifying infra failures and retrying exactly once after a rebind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sbx_domain::error::{Error, Result};

use super::{PhysicalTerminalRuntime, RuntimeExecResult};
use crate::lease::LeaseStore;
use crate::provider::{InfraErrorClassifier, SandboxProvider};

pub struct RemoteWrappedRuntime {
    lease_id: String,
    provider: Arc<dyn SandboxProvider>,
    lease_store: Arc<LeaseStore>,
    classifier: Arc<dyn InfraErrorClassifier>,
    hydrated: AtomicBool,
}

impl RemoteWrappedRuntime {
    pub fn new(
        lease_id: String,
        provider: Arc<dyn SandboxProvider>,
        lease_store: Arc<LeaseStore>,
        classifier: Arc<dyn InfraErrorClassifier>,
    ) -> Self {
        Self { lease_id, provider, lease_store, classifier, hydrated: AtomicBool::new(false) }
    }

    async fn instance_id(&self) -> Result<String> {
        let lease = self.lease_store.ensure_active_instance(&self.lease_id, self.provider.as_ref()).await?;
        lease.current_instance_id.ok_or_else(|| {
            Error::SchemaInconsistency(format!("lease {} has no bound instance after ensure", self.lease_id))
        })
    }

    async fn hydrate(&self, instance_id: &str, cwd: &str, env_delta: &serde_json::Value) -> Result<()> {
        self.provider.execute(instance_id, &format!("cd {cwd}"), 5_000, None).await?;
        if let Some(map) = env_delta.as_object() {
            for (key, value) in map {
                if let Some(value) = value.as_str() {
                    self.provider.execute(instance_id, &format!("export {key}={value}"), 5_000, None).await?;
                }
            }
        }
        self.hydrated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn try_once(&self, instance_id: &str, command: &str, timeout_ms: u64, cwd: &str) -> Result<RuntimeExecResult> {
        let result = self.provider.execute(instance_id, command, timeout_ms, Some(cwd)).await?;
        if result.timed_out {
            return Ok(RuntimeExecResult { output: result.output, exit_code: -1, timed_out: true, new_cwd: None });
        }

        let new_cwd = if looks_like_cd(command) {
            match self.provider.execute(instance_id, "pwd", 5_000, Some(cwd)).await {
                Ok(probe) if probe.exit_code == 0 => {
                    let probed = probe.output.trim().to_string();
                    if probed.is_empty() || probed == cwd {
                        None
                    } else {
                        Some(probed)
                    }
                }
                _ => None,
            }
        } else {
            None
        };

        Ok(RuntimeExecResult { output: result.output, exit_code: result.exit_code, timed_out: false, new_cwd })
    }
}

fn looks_like_cd(command: &str) -> bool {
    command.split([';', '&', '|']).any(|part| part.trim_start().starts_with("cd "))
        || command.trim() == "cd"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::FakeProvider;
    use crate::provider::{DirEntry, ProviderExecResult, SessionInfo};
    use sbx_domain::ProviderCapability;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn looks_like_cd_matches_bare_and_chained_cd() {
        assert!(looks_like_cd("cd /tmp"));
        assert!(looks_like_cd("cd"));
        assert!(looks_like_cd("echo hi; cd /tmp"));
        assert!(looks_like_cd("cd /tmp && ls"));
        assert!(!looks_like_cd("echo cd /tmp"));
        assert!(!looks_like_cd("mkdir cd"));
    }

    /// Wraps a `FakeProvider` but fails the first `N` `execute` calls with an
    /// infra error, then delegates to the inner provider.
    struct FlakyProvider {
        inner: FakeProvider,
        fail_remaining: AtomicU64,
    }

    impl FlakyProvider {
        fn new(fail_first_n: u64) -> Self {
            Self { inner: FakeProvider::new("flaky"), fail_remaining: AtomicU64::new(fail_first_n) }
        }
    }

    #[async_trait]
    impl SandboxProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn capability(&self) -> ProviderCapability {
            self.inner.capability()
        }

        async fn create_session(&self, context_id: Option<&str>) -> Result<SessionInfo> {
            self.inner.create_session(context_id).await
        }

        async fn destroy_session(&self, session_id: &str) -> Result<bool> {
            self.inner.destroy_session(session_id).await
        }

        async fn pause_session(&self, session_id: &str) -> Result<bool> {
            self.inner.pause_session(session_id).await
        }

        async fn resume_session(&self, session_id: &str) -> Result<bool> {
            self.inner.resume_session(session_id).await
        }

        async fn get_session_status(&self, session_id: &str) -> Result<String> {
            self.inner.get_session_status(session_id).await
        }

        async fn execute(
            &self,
            session_id: &str,
            command: &str,
            timeout_ms: u64,
            cwd: Option<&str>,
        ) -> Result<ProviderExecResult> {
            // Hydration (`cd`/`export`) always succeeds here — only the
            // substantive command is made to fail, so the test exercises
            // `try_once`'s retry path rather than hydration's bubble-up.
            let is_hydration = command.starts_with("cd ") || command.starts_with("export ");
            if !is_hydration {
                let remaining = self.fail_remaining.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                    return Err(Error::ProviderInfra {
                        provider: "flaky".into(),
                        message: "connection reset by peer".into(),
                    });
                }
            }
            self.inner.execute(session_id, command, timeout_ms, cwd).await
        }

        async fn read_file(&self, session_id: &str, path: &str) -> Result<String> {
            self.inner.read_file(session_id, path).await
        }

        async fn write_file(&self, session_id: &str, path: &str, content: &str) -> Result<()> {
            self.inner.write_file(session_id, path, content).await
        }

        async fn list_dir(&self, session_id: &str, path: &str) -> Result<Vec<DirEntry>> {
            self.inner.list_dir(session_id, path).await
        }
    }

    async fn runtime_with(provider: Arc<dyn SandboxProvider>) -> RemoteWrappedRuntime {
        let pool = sbx_storage::open_in_memory().await.unwrap();
        let lease_store = Arc::new(LeaseStore::new(pool, 3));
        lease_store.create("lease-1", provider.name()).await.unwrap();
        RemoteWrappedRuntime::new(
            "lease-1".into(),
            provider,
            lease_store,
            Arc::new(crate::provider::DefaultInfraErrorClassifier),
        )
    }

    #[tokio::test]
    async fn execute_hydrates_once_then_reuses_instance() {
        let provider: Arc<dyn SandboxProvider> = Arc::new(FakeProvider::new("fake"));
        let runtime = runtime_with(provider.clone()).await;

        let a = runtime.execute("echo hi", Duration::from_secs(5), "/work", &serde_json::json!({})).await.unwrap();
        assert_eq!(a.exit_code, 0);
        assert!(a.output.contains("echo hi"));

        runtime.execute("echo again", Duration::from_secs(5), "/work", &serde_json::json!({})).await.unwrap();
        // `hydrated` only flips once; `instance_id()` on the second call is a
        // lockless freshness check, not a fresh `create_session`.
    }

    #[tokio::test]
    async fn infra_error_is_retried_exactly_once_after_rebind() {
        let provider: Arc<dyn SandboxProvider> = Arc::new(FlakyProvider::new(1));
        let runtime = runtime_with(provider).await;

        let result = runtime.execute("echo hi", Duration::from_secs(5), "/work", &serde_json::json!({})).await.unwrap();
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn infra_error_surfaces_after_exhausting_the_single_retry() {
        let provider: Arc<dyn SandboxProvider> = Arc::new(FlakyProvider::new(2));
        let runtime = runtime_with(provider).await;

        let err = runtime.execute("echo hi", Duration::from_secs(5), "/work", &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ProviderInfra { .. }));
    }
}

#[async_trait]
impl PhysicalTerminalRuntime for RemoteWrappedRuntime {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cwd: &str,
        env_delta: &serde_json::Value,
    ) -> Result<RuntimeExecResult> {
        let instance_id = self.instance_id().await?;
        if !self.hydrated.load(Ordering::SeqCst) {
            self.hydrate(&instance_id, cwd, env_delta).await?;
        }

        let timeout_ms = timeout.as_millis() as u64;
        match self.try_once(&instance_id, command, timeout_ms, cwd).await {
            Ok(result) => Ok(result),
            Err(err) if self.classifier.is_infra_error(&err.to_string()) => {
                // Force a refresh so `instance_id()`'s `ensure_active_instance`
                // call doesn't just hand back the same stale binding from its
                // freshness fast path, then rebind and retry exactly once.
                self.lease_store.mark_needs_refresh(&self.lease_id).await?;
                let instance_id = self.instance_id().await?;
                self.hydrated.store(false, Ordering::SeqCst);
                self.hydrate(&instance_id, cwd, env_delta).await?;
                self.try_once(&instance_id, command, timeout_ms, cwd).await
            }
            Err(err) => Err(err),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
