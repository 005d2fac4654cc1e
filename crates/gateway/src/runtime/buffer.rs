//! In-memory, cursor-addressable event buffer for one run.
//!
//! The persisted `run_events` log (`sbx_storage::run_events`) is the
//! durable source of truth and the only thing that survives a restart;
//! this buffer exists so a live SSE consumer doesn't have to poll the
//! database between polls. Every event here has already been durably
//! appended — [`super::pipeline`] calls `append_event` to obtain `seq`
//! before ever calling [`RunEventBuffer::put`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sbx_domain::run_event::RunEvent;
use tokio::sync::Notify;

pub struct RunEventBuffer {
    events: Mutex<Vec<RunEvent>>,
    finished: AtomicBool,
    notify: Notify,
}

impl Default for RunEventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RunEventBuffer {
    pub fn new() -> Self {
        Self { events: Mutex::new(Vec::new()), finished: AtomicBool::new(false), notify: Notify::new() }
    }

    pub fn put(&self, event: RunEvent) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }

    /// Marks the run complete. No further `put` calls are expected after
    /// this; consumers use it to know when to stop polling.
    pub fn mark_done(&self) {
        self.finished.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn since(&self, after_seq: i64) -> Vec<RunEvent> {
        self.events.lock().iter().filter(|e| e.seq > after_seq).cloned().collect()
    }

    /// Returns every buffered event with `seq > after_seq`. If none are
    /// available yet and the run isn't finished, waits up to `timeout` for
    /// new events before returning empty — this is what lets the SSE
    /// handler interleave `: keepalive` comments instead of blocking
    /// forever on a quiet run.
    pub async fn next_batch(&self, after_seq: i64, timeout: Duration) -> (Vec<RunEvent>, bool) {
        let batch = self.since(after_seq);
        if !batch.is_empty() {
            return (batch, self.is_done());
        }
        if self.is_done() {
            return (Vec::new(), true);
        }
        // Register interest before re-checking the condition — otherwise a
        // `put`/`mark_done` landing between the checks above and the
        // `notified()` call is missed, and we'd block for the full timeout
        // instead of waking immediately.
        let notified = self.notify.notified();
        let batch = self.since(after_seq);
        if !batch.is_empty() {
            return (batch, self.is_done());
        }
        if self.is_done() {
            return (Vec::new(), true);
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        (self.since(after_seq), self.is_done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ev(seq: i64) -> RunEvent {
        RunEvent {
            seq,
            thread_id: "t1".into(),
            run_id: "r1".into(),
            event_type: "text".into(),
            data: serde_json::json!({}),
            message_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn next_batch_returns_immediately_when_events_present() {
        let buf = RunEventBuffer::new();
        buf.put(ev(1));
        buf.put(ev(2));
        let (batch, done) = buf.next_batch(0, Duration::from_millis(50)).await;
        assert_eq!(batch.len(), 2);
        assert!(!done);
    }

    #[tokio::test]
    async fn next_batch_reports_done_when_finished_and_dry() {
        let buf = RunEventBuffer::new();
        buf.put(ev(1));
        buf.mark_done();
        let (batch, done) = buf.next_batch(1, Duration::from_millis(50)).await;
        assert!(batch.is_empty());
        assert!(done);
    }

    #[tokio::test]
    async fn next_batch_times_out_when_nothing_new() {
        let buf = RunEventBuffer::new();
        let (batch, done) = buf.next_batch(0, Duration::from_millis(20)).await;
        assert!(batch.is_empty());
        assert!(!done);
    }

    #[tokio::test]
    async fn next_batch_wakes_on_put() {
        use std::sync::Arc;
        let buf = Arc::new(RunEventBuffer::new());
        let buf2 = buf.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            buf2.put(ev(5));
        });
        let (batch, _) = buf.next_batch(0, Duration::from_secs(2)).await;
        handle.await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
