//! `LocalProvider`: a bare-metal `SandboxProvider` backed by a directory on
//! this host. Used when no remote compute backend is configured — the
//! default in single-developer/demo deployments, and the provider the idle
//! reaper is hard-exempt for.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sbx_domain::error::{Error, Result};
use sbx_domain::ProviderCapability;
use tokio::io::AsyncWriteExt;

use crate::provider::{DirEntry, ProviderExecResult, SandboxProvider, SessionInfo};

pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn resolve(&self, session_id: &str, path: &str) -> Result<PathBuf> {
        let base = self.session_dir(session_id);
        let joined = if Path::new(path).is_absolute() {
            base.join(path.trim_start_matches('/'))
        } else {
            base.join(path)
        };
        Ok(joined)
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn capability(&self) -> ProviderCapability {
        ProviderCapability::local()
    }

    async fn create_session(&self, _context_id: Option<&str>) -> Result<SessionInfo> {
        let session_id = format!("local-{}", uuid::Uuid::new_v4());
        let dir = self.session_dir(&session_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(SessionInfo {
            session_id,
            provider: self.name().to_string(),
            status: "running".into(),
            metadata: HashMap::from([(
                "cwd".to_string(),
                serde_json::Value::String(dir.to_string_lossy().to_string()),
            )]),
        })
    }

    async fn destroy_session(&self, session_id: &str) -> Result<bool> {
        let dir = self.session_dir(session_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn pause_session(&self, _session_id: &str) -> Result<bool> {
        Err(Error::CapabilityUnsupported { provider: self.name().to_string(), capability: "pause".into() })
    }

    async fn resume_session(&self, _session_id: &str) -> Result<bool> {
        Err(Error::CapabilityUnsupported { provider: self.name().to_string(), capability: "resume".into() })
    }

    async fn get_session_status(&self, session_id: &str) -> Result<String> {
        Ok(if self.session_dir(session_id).exists() { "running".into() } else { "detached".into() })
    }

    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout_ms: u64,
        cwd: Option<&str>,
    ) -> Result<ProviderExecResult> {
        let workdir = match cwd {
            Some(cwd) => self.resolve(session_id, cwd)?,
            None => self.session_dir(session_id),
        };
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&workdir);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn()?;
        let timeout = std::time::Duration::from_millis(timeout_ms);
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(ProviderExecResult {
                    output: combined,
                    exit_code: output.status.code().unwrap_or(-1),
                    error: None,
                    timed_out: false,
                })
            }
            Ok(Err(err)) => Err(Error::Io(err)),
            Err(_) => Ok(ProviderExecResult::timed_out()),
        }
    }

    async fn read_file(&self, session_id: &str, path: &str) -> Result<String> {
        let full = self.resolve(session_id, path)?;
        Ok(tokio::fs::read_to_string(full).await?)
    }

    async fn write_file(&self, session_id: &str, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(session_id, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(full).await?;
        file.write_all(content.as_bytes()).await?;
        Ok(())
    }

    async fn list_dir(&self, session_id: &str, path: &str) -> Result<Vec<DirEntry>> {
        let full = self.resolve(session_id, path)?;
        let mut read_dir = tokio::fs::read_dir(full).await?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_file() { Some(metadata.len()) } else { None },
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_write_then_read_round_trips() {
        let dir = std::env::temp_dir().join(format!("sbx-local-provider-test-{}", uuid::Uuid::new_v4()));
        let provider = LocalProvider::new(dir.clone());
        let session = provider.create_session(None).await.unwrap();

        provider.write_file(&session.session_id, "hello.txt", "hi there").await.unwrap();
        let content = provider.read_file(&session.session_id, "hello.txt").await.unwrap();
        assert_eq!(content, "hi there");

        let entries = provider.list_dir(&session.session_id, ".").await.unwrap();
        assert!(entries.iter().any(|e| e.name == "hello.txt"));

        provider.destroy_session(&session.session_id).await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn execute_runs_shell_command() {
        let dir = std::env::temp_dir().join(format!("sbx-local-provider-test-{}", uuid::Uuid::new_v4()));
        let provider = LocalProvider::new(dir.clone());
        let session = provider.create_session(None).await.unwrap();

        let result = provider.execute(&session.session_id, "echo hi", 5_000, None).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("hi"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn pause_is_unsupported() {
        let provider = LocalProvider::new(std::env::temp_dir());
        let err = provider.pause_session("whatever").await.unwrap_err();
        assert!(matches!(err, Error::CapabilityUnsupported { .. }));
    }
}
