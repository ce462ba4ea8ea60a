//! Chat event taxonomy and task-tag dispatch (spec §4.5).

use serde::{Deserialize, Serialize};

/// One event in a chat turn's stream. The `type` tag and field names match
/// what the edge expects verbatim (spec §4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    System { text: String },
    Text { text: String },
    TextDelta { text: String },
    Thinking { text: String },
    ToolUse { id: String, tool: String, input: serde_json::Value },
    ToolResult { id: String, result: serde_json::Value },
    Result { duration_ms: u64, cost_usd: Option<f64>, input_tokens: Option<u64>, output_tokens: Option<u64> },
    Error { message: String },
    Interrupted { reason: String },
}

impl ChatEvent {
    /// Exactly one of `result`/`error`/`interrupted` ends a turn (spec §4.5
    /// ordering guarantee 3).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. } | Self::Error { .. } | Self::Interrupted { .. })
    }

    /// The SSE event name this event is framed under on the wire.
    pub fn sse_event_name(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::Text { .. } => "text",
            Self::TextDelta { .. } => "text_delta",
            Self::Thinking { .. } => "thinking",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}

/// The task tags the system enumerates for prompt-rewriting dispatch (spec
/// §4.5 "Routing by task_tag"). Dispatch is pure command construction; this
/// type never interprets PRD semantics itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTag {
    PrdDecompose,
    AnalyzePrd,
    PrdChange,
    ConfirmPrd,
    Chat,
}

impl TaskTag {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "prd-decompose" => Self::PrdDecompose,
            "analyze-prd" => Self::AnalyzePrd,
            "prd-change" => Self::PrdChange,
            "confirm-prd" => Self::ConfirmPrd,
            _ => Self::Chat,
        }
    }
}

/// The command the agent's RPC endpoint actually receives, after task-tag
/// dispatch has rewritten the raw prompt (spec §4.5).
#[derive(Debug, Clone, Serialize)]
pub struct AgentCommand {
    pub command: &'static str,
    pub argument: String,
}

/// Rewrites `(prompt, task_tag)` into the command the agent invokes. A pure
/// function: no I/O, no PRD interpretation.
pub fn dispatch(prompt: &str, task_tag: &str) -> AgentCommand {
    match TaskTag::parse(task_tag) {
        TaskTag::PrdDecompose => AgentCommand {
            command: "decompose_prd",
            argument: prompt.to_string(),
        },
        TaskTag::AnalyzePrd => AgentCommand {
            command: "analyze_module",
            argument: prompt.to_string(),
        },
        TaskTag::PrdChange => AgentCommand {
            command: "modify_prd",
            argument: prompt.to_string(),
        },
        TaskTag::ConfirmPrd => AgentCommand {
            command: "confirm_prd_edits",
            argument: String::new(),
        },
        TaskTag::Chat => AgentCommand {
            command: "chat",
            argument: prompt.to_string(),
        },
    }
}
