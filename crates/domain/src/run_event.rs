use serde::{Deserialize, Serialize};

/// The content synthesized into a tool_result checkpoint marker for any
/// tool call still pending when a run is cancelled.
pub const CANCELLED_TOOL_RESULT_CONTENT: &str = "Cancelled by user.";

/// Event types that can appear on a run's buffer / persisted log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Text,
    ToolCall,
    ToolResult,
    Status,
    Cancelled,
    Done,
    Error,
    /// A subagent-originated event forwarded with a `subagent_` prefix;
    /// the wrapped kind is carried separately so the original type string
    /// can be reconstructed (`subagent_{inner}`).
    Subagent,
}

impl RunEventKind {
    /// The literal `event:` field sent over SSE, including the
    /// `subagent_<original>` composition rule from 
    pub fn wire_name(&self, subagent_inner: Option<&str>) -> String {
        match (self, subagent_inner) {
            (Self::Subagent, Some(inner)) => format!("subagent_{inner}"),
            (Self::Text, _) => "text".into(),
            (Self::ToolCall, _) => "tool_call".into(),
            (Self::ToolResult, _) => "tool_result".into(),
            (Self::Status, _) => "status".into(),
            (Self::Cancelled, _) => "cancelled".into(),
            (Self::Done, _) => "done".into(),
            (Self::Error, _) => "error".into(),
            (Self::Subagent, None) => "subagent".into(),
        }
    }
}

/// One emitted run event, already sequenced and ready to be persisted and
/// handed to buffer consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: i64,
    pub thread_id: String,
    pub run_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
    pub message_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
