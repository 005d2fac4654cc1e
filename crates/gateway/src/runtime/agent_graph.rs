//! Abstract seam for the LLM agent graph and its tool implementations —
//! out of scope for this crate beyond the interface it streams through.
//!
//! [`AgentGraph::run`] takes a channel rather than returning a stream
//! directly: a real implementation is free to spawn one task per upstream
//! stream (model tokens, tool-runner progress) and have both `tx.send`
//! into the same channel — [`super::pipeline`] is the forwarder task that
//! owns the receiver and sequences/persists what comes out the other end.

use async_trait::async_trait;
use sbx_domain::error::Result;
use tokio::sync::mpsc;

use super::cancel::CancelToken;

#[derive(Debug, Clone)]
pub struct AgentRunContext {
    pub thread_id: String,
    pub run_id: String,
    pub cancel: CancelToken,
}

/// One unit of agent-graph output. Mirrors `sbx_domain::run_event::RunEventKind`
/// minus `Cancelled`/`Done`/`Error`, which the pipeline synthesizes itself
/// rather than sourcing from the agent graph.
#[derive(Debug, Clone)]
pub enum AgentChunk {
    Text { message_id: String, delta: String },
    ToolCall { tool_call_id: String, name: String, arguments: serde_json::Value },
    ToolResult { tool_call_id: String, name: String, content: serde_json::Value },
    Status { message: String },
    /// A chunk forwarded from a subagent's own run. `inner` carries the
    /// wrapped chunk; the pipeline rewrites its wire event type with the
    /// `subagent_` prefix and attaches `parent_tool_call_id`.
    Subagent { parent_tool_call_id: String, inner: Box<AgentChunk> },
}

#[async_trait]
pub trait AgentGraph: Send + Sync {
    /// Streams chunks for one run into `tx` until the graph finishes or
    /// `ctx.cancel` is observed. Returning `Err` surfaces as an `error`
    /// event; returning `Ok` after `ctx.cancel.is_cancelled()` is how a
    /// graph signals a clean cancellation-acknowledged stop.
    async fn run(&self, ctx: AgentRunContext, tx: mpsc::Sender<AgentChunk>) -> Result<()>;

    /// Writes synthesized tool_result markers into the agent's own
    /// checkpoint for every tool call left pending at cancellation time
    ///. Graphs with no checkpoint of
    /// their own (e.g. stateless test doubles) can leave this a no-op.
    async fn record_cancelled_tool_results(&self, _ctx: &AgentRunContext, _pending_tool_call_ids: &[String]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Scripted test double: emits a fixed sequence of chunks, optionally
    /// pausing between them so a test can cancel mid-stream, and records
    /// which tool-call ids were checkpointed as cancelled.
    pub struct FakeAgentGraph {
        pub chunks: Vec<AgentChunk>,
        pub pause_after: Option<usize>,
        pub pause: std::time::Duration,
        pub cancelled_checkpoints: Arc<Mutex<Vec<String>>>,
    }

    impl FakeAgentGraph {
        pub fn new(chunks: Vec<AgentChunk>) -> Self {
            Self { chunks, pause_after: None, pause: std::time::Duration::from_millis(0), cancelled_checkpoints: Arc::new(Mutex::new(Vec::new())) }
        }

        pub fn pausing_after(mut self, index: usize, pause: std::time::Duration) -> Self {
            self.pause_after = Some(index);
            self.pause = pause;
            self
        }
    }

    #[async_trait]
    impl AgentGraph for FakeAgentGraph {
        async fn run(&self, ctx: AgentRunContext, tx: mpsc::Sender<AgentChunk>) -> Result<()> {
            for (i, chunk) in self.chunks.iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                if tx.send(chunk.clone()).await.is_err() {
                    break;
                }
                if self.pause_after == Some(i) {
                    tokio::time::sleep(self.pause).await;
                }
            }
            Ok(())
        }

        async fn record_cancelled_tool_results(&self, _ctx: &AgentRunContext, pending_tool_call_ids: &[String]) -> Result<()> {
            self.cancelled_checkpoints.lock().extend(pending_tool_call_ids.iter().cloned());
            Ok(())
        }
    }
}
