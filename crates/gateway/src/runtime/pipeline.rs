//! Run producer/consumer: ensures the thread's sandbox session
//! is live (auto-resuming a paused one), drains the agent graph's chunk
//! stream into durably-sequenced [`sbx_domain::run_event::RunEvent`]s, and
//! always closes the run with exactly one terminal event
//! (`cancelled`/`error`/`done`).
//!
//! Persistence precedes visibility: every event is appended via
//! `sbx_storage::run_events::append` (which hands back the DB-issued
//! monotone `seq`) before it is ever put on the in-memory buffer that SSE
//! consumers read from — this is the emission contract.

use std::collections::HashSet;

use chrono::Utc;
use sbx_domain::error::Result;
use sbx_domain::run_event::{RunEvent, RunEventKind};
use sbx_domain::trace::TraceEvent;
use tokio::sync::mpsc;

use crate::state::AppState;
use super::agent_graph::{AgentChunk, AgentGraph, AgentRunContext};

fn describe(chunk: &AgentChunk) -> (RunEventKind, serde_json::Value, Option<String>) {
    match chunk {
        AgentChunk::Text { message_id, delta } => {
            (RunEventKind::Text, serde_json::json!({ "delta": delta }), Some(message_id.clone()))
        }
        AgentChunk::ToolCall { tool_call_id, name, arguments } => (
            RunEventKind::ToolCall,
            serde_json::json!({ "tool_call_id": tool_call_id, "name": name, "arguments": arguments }),
            None,
        ),
        AgentChunk::ToolResult { tool_call_id, name, content } => (
            RunEventKind::ToolResult,
            serde_json::json!({ "tool_call_id": tool_call_id, "name": name, "content": content }),
            None,
        ),
        AgentChunk::Status { message } => (RunEventKind::Status, serde_json::json!({ "message": message }), None),
        AgentChunk::Subagent { parent_tool_call_id, inner } => {
            let (inner_kind, mut data, message_id) = describe(inner);
            if let Some(obj) = data.as_object_mut() {
                obj.insert("parent_tool_call_id".into(), serde_json::json!(parent_tool_call_id));
            }
            let wire = RunEventKind::Subagent.wire_name(Some(&inner_kind.wire_name(None)));
            // Stash the composed wire name; callers read it back via `wire_name_override`.
            if let Some(obj) = data.as_object_mut() {
                obj.insert("__wire".into(), serde_json::json!(wire));
            }
            (RunEventKind::Subagent, data, message_id)
        }
    }
}

/// Tool-call id referenced by a chunk, if any — used to track which calls
/// are still outstanding when the run ends.
fn tool_call_id_of(chunk: &AgentChunk) -> Option<(&str, bool /* is_call (true) vs is_result (false) */)> {
    match chunk {
        AgentChunk::ToolCall { tool_call_id, .. } => Some((tool_call_id, true)),
        AgentChunk::ToolResult { tool_call_id, .. } => Some((tool_call_id, false)),
        AgentChunk::Subagent { inner, .. } => tool_call_id_of(inner),
        _ => None,
    }
}

struct RunCtx<'a> {
    state: &'a AppState,
    thread_id: String,
    run_id: String,
    buffer: std::sync::Arc<super::buffer::RunEventBuffer>,
}

impl<'a> RunCtx<'a> {
    async fn emit(&self, kind: RunEventKind, mut data: serde_json::Value, message_id: Option<String>) -> Result<()> {
        let wire = if let Some(obj) = data.as_object_mut() {
            obj.remove("__wire").and_then(|v| v.as_str().map(str::to_string))
        } else {
            None
        };
        let event_type = wire.unwrap_or_else(|| kind.wire_name(None));
        let data_json = serde_json::to_string(&data)?;
        let seq = sbx_storage::run_events::append(
            &self.state.pool,
            &self.thread_id,
            &self.run_id,
            &event_type,
            &data_json,
            message_id.as_deref(),
        )
        .await?;
        let event = RunEvent {
            seq,
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            event_type: event_type.clone(),
            data,
            message_id,
            created_at: Utc::now(),
        };
        self.buffer.put(event);
        TraceEvent::RunEventEmitted {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            seq,
            event_type,
        }
        .emit();
        Ok(())
    }
}

/// Drives one run end to end. Callers must already hold the thread's run
/// lock (`state.thread_locks`) for the duration of this call — the
/// registry only tracks bookkeeping, it does not itself serialize.
pub async fn run_once(
    state: &AppState,
    graph: std::sync::Arc<dyn AgentGraph>,
    thread_id: String,
    run_id: String,
    provider_name: &str,
) -> Result<()> {
    state.sandbox.get_sandbox(&thread_id, provider_name).await?;

    let (buffer, cancel) = state.run_registry.start_run(&thread_id, &run_id);
    let ctx = RunCtx { state, thread_id: thread_id.clone(), run_id: run_id.clone(), buffer };

    let (tx, mut rx) = mpsc::channel::<AgentChunk>(64);
    let agent_ctx = AgentRunContext { thread_id: thread_id.clone(), run_id: run_id.clone(), cancel: cancel.clone() };
    let graph_for_task = graph.clone();
    let agent_ctx_for_task = agent_ctx.clone();
    let handle = tokio::spawn(async move { graph_for_task.run(agent_ctx_for_task, tx).await });

    let mut pending_tool_calls: HashSet<String> = HashSet::new();
    let mut was_cancelled = false;

    while let Some(chunk) = rx.recv().await {
        if let Some((id, is_call)) = tool_call_id_of(&chunk) {
            if is_call {
                pending_tool_calls.insert(id.to_string());
            } else {
                pending_tool_calls.remove(id);
            }
        }
        let (kind, data, message_id) = describe(&chunk);
        ctx.emit(kind, data, message_id).await?;

        if cancel.is_cancelled() {
            was_cancelled = true;
            break;
        }
    }

    // Drain whatever the agent-graph task returns; it may already have
    // stopped sending because it observed cancellation itself.
    let graph_result = handle.await.map_err(|e| sbx_domain::error::Error::Other(format!("agent graph task panicked: {e}")));

    let mut cancelled_tool_call_ids: Vec<String> = Vec::new();
    let terminal_kind = if was_cancelled || cancel.is_cancelled() {
        cancelled_tool_call_ids = pending_tool_calls.into_iter().collect();
        if !cancelled_tool_call_ids.is_empty() {
            graph.record_cancelled_tool_results(&agent_ctx, &cancelled_tool_call_ids).await?;
            for tool_call_id in &cancelled_tool_call_ids {
                ctx.emit(
                    RunEventKind::ToolResult,
                    serde_json::json!({
                        "tool_call_id": tool_call_id,
                        "content": sbx_domain::run_event::CANCELLED_TOOL_RESULT_CONTENT,
                        "synthesized": true,
                        "reason": "cancelled",
                    }),
                    None,
                )
                .await?;
            }
        }
        RunEventKind::Cancelled
    } else {
        match graph_result {
            Ok(Ok(())) => RunEventKind::Done,
            Ok(Err(e)) => {
                ctx.emit(RunEventKind::Error, serde_json::json!({ "message": e.to_string() }), None).await?;
                RunEventKind::Done
            }
            Err(e) => {
                ctx.emit(RunEventKind::Error, serde_json::json!({ "message": e.to_string() }), None).await?;
                RunEventKind::Done
            }
        }
    };

    if terminal_kind == RunEventKind::Cancelled {
        ctx.emit(
            RunEventKind::Cancelled,
            serde_json::json!({ "cancelled_tool_call_ids": cancelled_tool_call_ids }),
            None,
        )
        .await?;
    }
    ctx.emit(RunEventKind::Done, serde_json::json!({}), None).await?;

    state.run_registry.finish_run(&run_id);
    sbx_storage::run_events::cleanup_old_runs(&state.pool, &thread_id, state.config.engine.keep_latest_runs).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use sbx_sandbox::provider::tests::FakeProvider;
    use sbx_sandbox::provider::ProviderRegistry;
    use sbx_sandbox::SandboxManager;

    use crate::config::GatewayConfig;
    use crate::runtime::agent_graph::tests::FakeAgentGraph;
    use crate::runtime::registry::RunRegistry;
    use crate::runtime::session_lock::SessionLockMap;
    use crate::state::AppState;

    use super::*;

    async fn test_state() -> AppState {
        let pool = sbx_storage::pool::open_in_memory().await.unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider::new("fake")));
        let sandbox = SandboxManager::new(pool.clone(), Default::default(), registry);
        AppState {
            config: Arc::new(GatewayConfig::default()),
            pool,
            sandbox: Arc::new(sandbox),
            thread_locks: Arc::new(SessionLockMap::new()),
            run_registry: Arc::new(RunRegistry::new()),
            api_token_hash: None,
        }
    }

    /// Scenario 3 (reconnect mid-run): 3 text chunks then done; a consumer
    /// reading `after=1` from the durable log must see exactly seq 2, 3, 4.
    #[tokio::test]
    async fn reconnecting_consumer_sees_only_events_past_its_cursor() {
        let state = test_state().await;
        let graph: Arc<dyn AgentGraph> = Arc::new(FakeAgentGraph::new(vec![
            AgentChunk::Text { message_id: "m1".into(), delta: "abc".into() },
            AgentChunk::Text { message_id: "m1".into(), delta: "def".into() },
            AgentChunk::Text { message_id: "m1".into(), delta: "ghi".into() },
        ]));

        run_once(&state, graph, "thread-B".into(), "run-1".into(), "fake").await.unwrap();

        let rows = sbx_storage::run_events::list_after(&state.pool, "thread-B", "run-1", 1).await.unwrap();
        let seqs: Vec<i64> = rows.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(rows.last().unwrap().event_type, "done");

        // `_seq` is strictly increasing and matches `run_events` insertion order.
        let all = sbx_storage::run_events::list_after(&state.pool, "thread-B", "run-1", 0).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    /// Scenario 4 (cancellation writes tool markers): one in-flight tool
    /// call, cancelled before its result arrives.
    #[tokio::test]
    async fn cancellation_mid_tool_call_emits_marker_and_cancelled_event() {
        let state = test_state().await;
        let fake_graph = Arc::new(
            FakeAgentGraph::new(vec![AgentChunk::ToolCall {
                tool_call_id: "tc_1".into(),
                name: "bash".into(),
                arguments: serde_json::json!({ "command": "sleep 60" }),
            }])
            .pausing_after(0, Duration::from_millis(500)),
        );
        let checkpoints = fake_graph.cancelled_checkpoints.clone();
        let graph: Arc<dyn AgentGraph> = fake_graph;

        let state_for_task = state.clone();
        let handle = tokio::spawn(async move {
            run_once(&state_for_task, graph, "thread-D".into(), "run-d".into(), "fake").await
        });

        // Poll until the run has registered itself, then cancel it.
        for _ in 0..100 {
            if state.run_registry.cancel("run-d") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.await.unwrap().unwrap();

        let rows = sbx_storage::run_events::list_after(&state.pool, "thread-D", "run-d", 0).await.unwrap();
        let cancelled_event = rows.iter().find(|r| r.event_type == "cancelled").expect("cancelled event");
        let cancelled_data: serde_json::Value = serde_json::from_str(&cancelled_event.data_json).unwrap();
        assert_eq!(cancelled_data["cancelled_tool_call_ids"], serde_json::json!(["tc_1"]));
        let tool_result = rows.iter().find(|r| r.event_type == "tool_result").expect("synthesized tool_result");
        let data: serde_json::Value = serde_json::from_str(&tool_result.data_json).unwrap();
        assert_eq!(data["tool_call_id"], "tc_1");
        assert_eq!(data["content"], sbx_domain::run_event::CANCELLED_TOOL_RESULT_CONTENT);
        assert_eq!(rows.last().unwrap().event_type, "done");
        assert!(rows.iter().any(|r| r.seq == cancelled_event.seq));

        assert_eq!(checkpoints.lock().clone(), vec!["tc_1".to_string()]);
    }
}
