//! Per-thread run bookkeeping (C8 buffer lifetime + C9 cancellation +
//! C10 single-in-flight-run enforcement and cascading cleanup).
//!
//! A thread has at most one in-flight run (enforced upstream by
//! `AppState::thread_locks`, a [`super::session_lock::SessionLockMap`]
//! keyed by thread id); this registry tracks which run that is, so a
//! reconnecting SSE client that only knows the thread id can find the
//! right buffer, and so a cancel request keyed by thread id reaches the
//! right token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::buffer::RunEventBuffer;
use super::cancel::{CancelMap, CancelToken};

struct RunEntry {
    buffer: Arc<RunEventBuffer>,
    thread_id: String,
    /// Set when the run finishes; the buffer is reaped
    /// `run_buffer_keepalive_sec` after this to give a disconnected SSE
    /// client a window to reconnect and drain the tail of the stream.
    done_since: Option<Instant>,
}

pub struct RunRegistry {
    runs: Mutex<HashMap<String, RunEntry>>,
    thread_current_run: Mutex<HashMap<String, String>>,
    cancel_map: CancelMap,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self { runs: Mutex::new(HashMap::new()), thread_current_run: Mutex::new(HashMap::new()), cancel_map: CancelMap::new() }
    }

    /// Registers a freshly-started run and returns its buffer + cancel
    /// token. Replaces any prior mapping for `thread_id` — callers must
    /// hold the thread's run lock, so there should be at most one.
    pub fn start_run(&self, thread_id: &str, run_id: &str) -> (Arc<RunEventBuffer>, CancelToken) {
        let buffer = Arc::new(RunEventBuffer::new());
        self.runs.lock().insert(
            run_id.to_string(),
            RunEntry { buffer: buffer.clone(), thread_id: thread_id.to_string(), done_since: None },
        );
        self.thread_current_run.lock().insert(thread_id.to_string(), run_id.to_string());
        let token = self.cancel_map.register(run_id);
        (buffer, token)
    }

    pub fn get_buffer(&self, run_id: &str) -> Option<Arc<RunEventBuffer>> {
        self.runs.lock().get(run_id).map(|e| e.buffer.clone())
    }

    pub fn current_run_id(&self, thread_id: &str) -> Option<String> {
        self.thread_current_run.lock().get(thread_id).cloned()
    }

    pub fn cancel(&self, run_id: &str) -> bool {
        self.cancel_map.cancel(run_id)
    }

    pub fn is_cancelled(&self, run_id: &str) -> bool {
        self.cancel_map.is_cancelled(run_id)
    }

    /// Marks the run's buffer done, drops its cancel token (the run is no
    /// longer cancellable — it already finished), and starts the
    /// keepalive countdown on its buffer.
    pub fn finish_run(&self, run_id: &str) {
        self.cancel_map.remove(run_id);
        let mut runs = self.runs.lock();
        if let Some(entry) = runs.get_mut(run_id) {
            entry.buffer.mark_done();
            entry.done_since = Some(Instant::now());
        }
    }

    /// Sweeps buffers whose run finished more than `keepalive` ago.
    pub fn sweep_finished(&self, keepalive: Duration) {
        let mut runs = self.runs.lock();
        runs.retain(|_, entry| match entry.done_since {
            Some(at) => at.elapsed() < keepalive,
            None => true,
        });
    }

    /// Cascading cleanup for thread deletion (C10): cancels any in-flight
    /// run and drops all tracked state for the thread. The caller is still
    /// responsible for the durable side — `destroy_thread_resources` and
    /// `run_events::delete_all_for_thread`.
    pub fn forget_thread(&self, thread_id: &str) {
        if let Some(run_id) = self.thread_current_run.lock().remove(thread_id) {
            self.cancel_map.cancel(&run_id);
            self.cancel_map.remove(&run_id);
            self.runs.lock().remove(&run_id);
        }
        let mut runs = self.runs.lock();
        let stale: Vec<String> =
            runs.iter().filter(|(_, e)| e.thread_id == thread_id).map(|(k, _)| k.clone()).collect();
        for run_id in stale {
            runs.remove(&run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_lookup_by_thread() {
        let reg = RunRegistry::new();
        let (_buf, _token) = reg.start_run("thread-1", "run-1");
        assert_eq!(reg.current_run_id("thread-1").as_deref(), Some("run-1"));
        assert!(reg.get_buffer("run-1").is_some());
    }

    #[test]
    fn finish_run_marks_buffer_done_and_drops_cancel() {
        let reg = RunRegistry::new();
        let (buf, _token) = reg.start_run("thread-1", "run-1");
        assert!(!reg.is_cancelled("run-1"));
        reg.finish_run("run-1");
        assert!(buf.is_done());
        assert!(!reg.cancel("run-1"));
    }

    #[test]
    fn sweep_removes_only_expired_finished_runs() {
        let reg = RunRegistry::new();
        reg.start_run("thread-1", "run-1");
        reg.finish_run("run-1");
        reg.sweep_finished(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        reg.sweep_finished(Duration::from_millis(0));
        assert!(reg.get_buffer("run-1").is_none());
    }

    #[test]
    fn forget_thread_cancels_and_drops() {
        let reg = RunRegistry::new();
        let (_buf, token) = reg.start_run("thread-1", "run-1");
        reg.forget_thread("thread-1");
        assert!(token.is_cancelled());
        assert!(reg.current_run_id("thread-1").is_none());
        assert!(reg.get_buffer("run-1").is_none());
    }
}
