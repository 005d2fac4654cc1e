//! Per-run cancellation tokens.
//!
//! Each in-flight run gets a `CancelToken`. The producer task polls
//! `is_cancelled()` between agent-graph chunks; observing it true is what
//! triggers the checkpoint-marker-then-`cancelled` sequence in
//! [`super::pipeline`]. Subagent runs share the same run's token rather
//! than cascading through a separate group — the subagent model is
//! event-type prefixing on one run's stream, not independently cancellable
//! child runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the active cancel token for each in-flight run, keyed by run id.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self { tokens: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, run_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(run_id.to_owned(), token.clone());
        token
    }

    /// Signals cancellation for `run_id`. Returns `true` if a token was
    /// found (i.e. the run is actually in flight).
    pub fn cancel(&self, run_id: &str) -> bool {
        if let Some(token) = self.tokens.lock().get(run_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn remove(&self, run_id: &str) {
        self.tokens.lock().remove(run_id);
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.tokens.lock().contains_key(run_id)
    }

    /// `true` if `run_id` has a registered token and it has been signalled.
    /// `false` for an unregistered or never-cancelled run.
    pub fn is_cancelled(&self, run_id: &str) -> bool {
        self.tokens.lock().get(run_id).map(|t| t.is_cancelled()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_map_register_and_cancel() {
        let map = CancelMap::new();
        let token = map.register("run-1");
        assert!(map.is_running("run-1"));
        assert!(map.cancel("run-1"));
        assert!(token.is_cancelled());

        map.remove("run-1");
        assert!(!map.is_running("run-1"));
        assert!(!map.cancel("run-1"));
    }

    #[test]
    fn cancel_nonexistent_run_returns_false() {
        let map = CancelMap::new();
        assert!(!map.cancel("ghost"));
    }

    #[test]
    fn cancel_token_clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
