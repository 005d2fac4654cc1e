use serde::{Deserialize, Serialize};

/// Tunable policy knobs for the sandbox engine. Exposed as config rather
/// than hardcoded so operators can tune them without touching the
/// invariants they gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEngineConfig {
    /// `ensure_active_instance`'s fast-path freshness window.
    #[serde(default = "d_lease_freshness_ttl_sec")]
    pub lease_freshness_ttl_sec: i64,
    /// Default `ChatSession.idle_ttl_sec`.
    #[serde(default = "d_chat_idle_ttl_sec")]
    pub chat_idle_ttl_sec: i64,
    /// Default `ChatSession.max_duration_sec`.
    #[serde(default = "d_chat_max_duration_sec")]
    pub chat_max_duration_sec: i64,
    /// `read_with_timeout` keepalive default for SSE consumers.
    #[serde(default = "d_run_buffer_keepalive_sec")]
    pub run_buffer_keepalive_sec: u64,
    /// `cleanup_old_runs(thread, keep_latest=K)` default K.
    #[serde(default = "d_keep_latest_runs")]
    pub keep_latest_runs: i64,
    /// Idle reaper sweep interval.
    #[serde(default = "d_idle_reaper_interval_sec")]
    pub idle_reaper_interval_sec: u64,
}

fn d_lease_freshness_ttl_sec() -> i64 {
    3
}
fn d_chat_idle_ttl_sec() -> i64 {
    300
}
fn d_chat_max_duration_sec() -> i64 {
    86_400
}
fn d_run_buffer_keepalive_sec() -> u64 {
    30
}
fn d_keep_latest_runs() -> i64 {
    1
}
fn d_idle_reaper_interval_sec() -> u64 {
    30
}

impl Default for SandboxEngineConfig {
    fn default() -> Self {
        Self {
            lease_freshness_ttl_sec: d_lease_freshness_ttl_sec(),
            chat_idle_ttl_sec: d_chat_idle_ttl_sec(),
            chat_max_duration_sec: d_chat_max_duration_sec(),
            run_buffer_keepalive_sec: d_run_buffer_keepalive_sec(),
            keep_latest_runs: d_keep_latest_runs(),
            idle_reaper_interval_sec: d_idle_reaper_interval_sec(),
        }
    }
}
