//! `LocalPersistentShellRuntime`: one long-lived interactive shell,
//! serialized by an async mutex, driven by marker-delimited round trips
//! that round-trip exit codes over stdin/stdout.
//!
//! Grounded in the established `tools::exec` process-management idiom —
//! `tokio::process::Command` with piped stdio and a single owning task per
//! child — adapted from "one-shot command + monitor task" to a persistent
//! shell.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sbx_domain::error::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::{PhysicalTerminalRuntime, RuntimeExecResult};

struct Inner {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    hydrated: bool,
}

/// Owns a long-lived `sh` child process. All I/O against it is serialized
/// through `inner`; `None` means the process is dead or has never been
/// spawned, and the next `execute` spawns a fresh one (re-hydrating from
/// the caller-supplied snapshot, since that is the only state a respawn
/// loses).
pub struct LocalPersistentShellRuntime {
    inner: Mutex<Option<Inner>>,
}

impl Default for LocalPersistentShellRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPersistentShellRuntime {
    pub fn new() -> Self {
        Self { inner: Mutex::new(None) }
    }

    fn spawn() -> Result<Inner> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::null());
        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| Error::Other("child has no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Other("child has no stdout".into()))?;
        Ok(Inner {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            hydrated: false,
        })
    }

    /// Writes `script` to the shell, then a marker line carrying `$?`, and
    /// reads lines until the marker is observed. Returns `(output_lines,
    /// exit_code)`. `timeout` bounds the whole round trip.
    async fn round_trip(inner: &mut Inner, script: &str, timeout: Duration) -> Result<(Vec<String>, i32)> {
        let marker = format!("__sbx_end_{}__", uuid::Uuid::new_v4().simple());
        let full = format!("{script}\nprintf '%s:%d\\n' '{marker}' \"$?\"\n");
        inner.stdin.write_all(full.as_bytes()).await?;
        inner.stdin.flush().await?;

        let read_fut = async {
            let mut lines = Vec::new();
            loop {
                match inner.stdout.next_line().await? {
                    Some(line) => {
                        if let Some(code) = line.strip_prefix(&format!("{marker}:")) {
                            let code: i32 = code.trim().parse().unwrap_or(-1);
                            return Ok::<_, Error>((lines, code));
                        }
                        lines.push(line);
                    }
                    None => return Err(Error::Other("shell closed stdout unexpectedly".into())),
                }
            }
        };

        match tokio::time::timeout(timeout, read_fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("local shell command".into())),
        }
    }

    async fn kill(inner: &mut Inner) {
        let _ = inner.child.start_kill();
        let _ = tokio::time::timeout(Duration::from_secs(5), inner.child.wait()).await;
    }
}

#[async_trait]
impl PhysicalTerminalRuntime for LocalPersistentShellRuntime {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cwd: &str,
        env_delta: &serde_json::Value,
    ) -> Result<RuntimeExecResult> {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            *guard = Some(Self::spawn()?);
        }
        let inner = guard.as_mut().expect("just populated");

        if !inner.hydrated {
            let mut hydrate_script = format!("cd {}", shell_quote(cwd));
            if let Some(map) = env_delta.as_object() {
                for (key, value) in map {
                    if let Some(value) = value.as_str() {
                        hydrate_script.push_str(&format!("\nexport {}={}", key, shell_quote(value)));
                    }
                }
            }
            if let Err(err) = Self::round_trip(inner, &hydrate_script, Duration::from_secs(5)).await {
                Self::kill(inner).await;
                *guard = None;
                return Err(err);
            }
            inner.hydrated = true;
        }

        // Re-issue the cwd on every call: the shell is long-lived but
        // hydration only runs once, so later commands still need the
        // terminal's current cwd if the caller's view of it changed
        // out-of-band (e.g. a sibling fork never touches this shell, so
        // this is mostly a no-op safety net).
        let script = format!("cd {} 2>/dev/null; {command}", shell_quote(cwd));

        let outcome = Self::round_trip(inner, &script, timeout).await;
        let (lines, exit_code) = match outcome {
            Ok(v) => v,
            Err(Error::Timeout(_)) => {
                Self::kill(inner).await;
                *guard = None;
                return Ok(RuntimeExecResult {
                    output: String::new(),
                    exit_code: -1,
                    timed_out: true,
                    new_cwd: None,
                });
            }
            Err(err) => {
                Self::kill(inner).await;
                *guard = None;
                return Err(err);
            }
        };

        let (pwd_lines, _) = Self::round_trip(inner, "pwd", Duration::from_secs(5)).await.unwrap_or_default();
        let new_cwd = pwd_lines
            .last()
            .filter(|p| p.as_str() != cwd)
            .cloned();

        Ok(RuntimeExecResult {
            output: lines.join("\n"),
            exit_code,
            timed_out: false,
            new_cwd,
        })
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(mut inner) = guard.take() {
            Self::kill(&mut inner).await;
        }
        Ok(())
    }
}

/// Minimal POSIX single-quote escaping: wraps in single quotes, turning
/// embedded `'` into `'\''`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_command_and_reports_exit_code() {
        let runtime = LocalPersistentShellRuntime::new();
        let result = runtime
            .execute("echo hello", Duration::from_secs(5), "/tmp", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("hello"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let runtime = LocalPersistentShellRuntime::new();
        let result = runtime
            .execute("exit 7", Duration::from_secs(5), "/tmp", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn close_is_always_safe() {
        let runtime = LocalPersistentShellRuntime::new();
        runtime.close().await.unwrap();
        runtime
            .execute("echo still-usable", Duration::from_secs(5), "/tmp", &serde_json::json!({}))
            .await
            .unwrap();
    }
}
