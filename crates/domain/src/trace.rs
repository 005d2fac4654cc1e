use serde::Serialize;

/// Structured trace events emitted across the sandbox engine crates.
///
/// Each variant is logged via `tracing::info!` with the serialized JSON as
/// a single field, matching the density the rest of this codebase uses for
/// high-signal lifecycle events rather than ad-hoc string interpolation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    LeaseApply {
        lease_id: String,
        event_type: String,
        from_state: String,
        to_state: String,
        ok: bool,
    },
    LeaseInstanceRebound {
        lease_id: String,
        old_instance_id: Option<String>,
        new_instance_id: String,
    },
    ChatSessionTransition {
        chat_session_id: String,
        thread_id: String,
        from: String,
        to: String,
        reason: String,
    },
    TerminalStateUpdated {
        terminal_id: String,
        state_version: i64,
    },
    RunEventEmitted {
        thread_id: String,
        run_id: String,
        seq: i64,
        event_type: String,
    },
    WebhookReceived {
        provider_name: String,
        instance_id: String,
        event_type: String,
        matched: bool,
    },
    IdleReaperSwept {
        checked: usize,
        paused: usize,
        closed: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sbx_event");
    }
}
