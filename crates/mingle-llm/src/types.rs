use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Conversation role in the neutral history model. System text travels
/// separately on the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One piece of a turn's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    /// `data` is always base64 at this level; URL resolution happens before
    /// the request is built.
    Image { data: String, mime: String },
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![Part::Text(text.into())],
        }
    }

    /// Concatenated text parts (images skipped).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text(t) = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(t);
            }
        }
        out
    }

    pub fn has_images(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Image { .. }))
    }
}

/// Tool definition advertised to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call extracted from an LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
    /// Gemini reasoning marker. Calls without one are dropped from replayed
    /// history by the Gemini backend's clean pre-pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// Result of one executed tool call, fed back into the loop.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
    /// Images a tool extracted; back-ends that cannot inline them into the
    /// result shape carry them in a follow-up user turn.
    pub images: Vec<Part>,
}

/// One item of replayable conversation history.
#[derive(Debug, Clone)]
pub enum HistoryItem {
    Turn(Turn),
    /// An assistant response that requested tools.
    ToolCalls { text: String, calls: Vec<ToolCall> },
    /// The results answering the preceding `ToolCalls` item.
    ToolResults(Vec<ToolOutcome>),
}

/// Request to an LLM back-end.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub history: Vec<HistoryItem>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

/// Parsed response from an LLM back-end.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

/// Common interface over the two wire-format families.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Back-end name for logging.
    fn name(&self) -> &str;

    /// Send one non-streaming request and wait for the full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, BackendError>;
}
