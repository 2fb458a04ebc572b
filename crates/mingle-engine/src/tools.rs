//! Built-in tools the scheduler exposes to the LLM roles.
//!
//! Observer gets the document writers; Reply gets the gateway send tool plus
//! read-only lookups. External tools come from the bridge and are dispatched
//! by the tool loop, not here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use mingle_core::types::Target;
use mingle_docs::{group_buffer, SocialWorkspace};
use mingle_gateway::{ChatGateway, SendRequest};
use mingle_llm::{Part, ToolDefinition};

use crate::prompt::EphemeralTokens;
use crate::state::{SentRecord, TargetState};

/// Result of executing a built-in tool.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    /// Images a tool extracted for the conversation (usually empty).
    pub images: Vec<Part>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            images: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            images: Vec::new(),
        }
    }
}

/// Trait all built-in tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, args: Value) -> ToolResult;
}

pub fn to_definitions(tools: &[Arc<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

// ---------------------------------------------------------------------------
// Document tools (observer role)
// ---------------------------------------------------------------------------

pub struct GroupRuleReadTool {
    pub docs: Arc<SocialWorkspace>,
    pub target_id: String,
}

#[async_trait]
impl Tool for GroupRuleReadTool {
    fn name(&self) -> &str {
        "group_rule_read"
    }
    fn description(&self) -> &str {
        "Read the rule notes kept for this chat room."
    }
    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn execute(&self, _args: Value) -> ToolResult {
        let content = self.docs.read_group_rule(&self.target_id);
        if content.is_empty() {
            ToolResult::success("(no rule notes yet)")
        } else {
            ToolResult::success(content)
        }
    }
}

pub struct GroupRuleWriteTool {
    pub docs: Arc<SocialWorkspace>,
    pub target_id: String,
}

#[async_trait]
impl Tool for GroupRuleWriteTool {
    fn name(&self) -> &str {
        "group_rule_write"
    }
    fn description(&self) -> &str {
        "Overwrite the rule notes kept for this chat room."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Full replacement document" }
            },
            "required": ["content"]
        })
    }
    async fn execute(&self, args: Value) -> ToolResult {
        let Some(content) = arg_str(&args, "content") else {
            return ToolResult::error("missing required parameter: content");
        };
        match self.docs.write_group_rule(&self.target_id, content) {
            Ok(()) => {
                info!(target = %self.target_id, "group rule updated");
                ToolResult::success("group rule saved")
            }
            Err(e) => ToolResult::error(format!("group rule write failed: {e}")),
        }
    }
}

pub struct SocialMemoryReadTool {
    pub docs: Arc<SocialWorkspace>,
}

#[async_trait]
impl Tool for SocialMemoryReadTool {
    fn name(&self) -> &str {
        "social_memory_read"
    }
    fn description(&self) -> &str {
        "Read the cross-room social memory document."
    }
    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn execute(&self, _args: Value) -> ToolResult {
        let content = self.docs.read_social_memory();
        if content.is_empty() {
            ToolResult::success("(social memory is empty)")
        } else {
            ToolResult::success(content)
        }
    }
}

pub struct SocialMemoryWriteTool {
    pub docs: Arc<SocialWorkspace>,
}

#[async_trait]
impl Tool for SocialMemoryWriteTool {
    fn name(&self) -> &str {
        "social_memory_write"
    }
    fn description(&self) -> &str {
        "Overwrite the cross-room social memory document."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Full replacement document" }
            },
            "required": ["content"]
        })
    }
    async fn execute(&self, args: Value) -> ToolResult {
        let Some(content) = arg_str(&args, "content") else {
            return ToolResult::error("missing required parameter: content");
        };
        match self.docs.write_social_memory(content) {
            Ok(()) => ToolResult::success("social memory saved"),
            Err(e) => ToolResult::error(format!("social memory write failed: {e}")),
        }
    }
}

pub struct ReplyStrategyReadTool {
    pub docs: Arc<SocialWorkspace>,
}

#[async_trait]
impl Tool for ReplyStrategyReadTool {
    fn name(&self) -> &str {
        "reply_strategy_read"
    }
    fn description(&self) -> &str {
        "Read the tunable reply-strategy document."
    }
    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn execute(&self, _args: Value) -> ToolResult {
        match self.docs.read_reply_strategy() {
            Some(content) => ToolResult::success(content),
            None => ToolResult::success("(no strategy document; the built-in default applies)"),
        }
    }
}

/// Only built when `agent_can_edit_strategy` is enabled.
pub struct ReplyStrategyWriteTool {
    pub docs: Arc<SocialWorkspace>,
}

#[async_trait]
impl Tool for ReplyStrategyWriteTool {
    fn name(&self) -> &str {
        "reply_strategy_write"
    }
    fn description(&self) -> &str {
        "Overwrite the tunable reply-strategy document."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Full replacement document" }
            },
            "required": ["content"]
        })
    }
    async fn execute(&self, args: Value) -> ToolResult {
        let Some(content) = arg_str(&args, "content") else {
            return ToolResult::error("missing required parameter: content");
        };
        match self.docs.write_reply_strategy(content) {
            Ok(()) => ToolResult::success("reply strategy saved"),
            Err(e) => ToolResult::error(format!("reply strategy write failed: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Read-only lookups (observer + reply)
// ---------------------------------------------------------------------------

/// Query the live buffer of the current target.
pub struct HistoryQueryTool {
    pub state: Arc<TargetState>,
}

#[async_trait]
impl Tool for HistoryQueryTool {
    fn name(&self) -> &str {
        "history_query"
    }
    fn description(&self) -> &str {
        "Look up recent messages of this room, optionally filtered by keyword."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max messages to return (default 20)" },
                "keyword": { "type": "string", "description": "Substring filter on content" }
            }
        })
    }
    async fn execute(&self, args: Value) -> ToolResult {
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
        let keyword = arg_str(&args, "keyword").map(String::from);

        let buffer = self.state.buffer.lock().unwrap();
        let lines: Vec<String> = buffer
            .messages()
            .iter()
            .filter(|m| {
                keyword
                    .as_deref()
                    .map_or(true, |k| m.content.contains(k))
            })
            .rev()
            .take(limit)
            .map(|m| format!("[{}] {}: {}", m.timestamp, m.sender_name, m.content))
            .collect();

        if lines.is_empty() {
            ToolResult::success("(no matching messages)")
        } else {
            let ordered: Vec<String> = lines.into_iter().rev().collect();
            ToolResult::success(ordered.join("\n"))
        }
    }
}

/// Query the archived summary sections of any known room.
pub struct GroupLogQueryTool {
    pub docs: Arc<SocialWorkspace>,
    pub default_target: String,
}

#[async_trait]
impl Tool for GroupLogQueryTool {
    fn name(&self) -> &str {
        "group_log_query"
    }
    fn description(&self) -> &str {
        "Read archived conversation summaries of a room, optionally for one date."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target": { "type": "string", "description": "Room id (default: current room)" },
                "date": { "type": "string", "description": "YYYY-MM-DD filter" }
            }
        })
    }
    async fn execute(&self, args: Value) -> ToolResult {
        let target = arg_str(&args, "target").unwrap_or(&self.default_target);
        let date = arg_str(&args, "date");

        let content = self.docs.read_group_buffer(target);
        if content.is_empty() {
            return ToolResult::success("(no archive for this room)");
        }
        let sections = group_buffer::split_sections(&content);
        let selected: Vec<String> = sections
            .iter()
            .filter(|s| date.map_or(true, |d| s.date() == d))
            .map(|s| format!("## {}\n{}", s.timestamp, s.body))
            .collect();
        if selected.is_empty() {
            ToolResult::success("(no sections for that date)")
        } else {
            ToolResult::success(selected.join("\n\n"))
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway send (reply role only)
// ---------------------------------------------------------------------------

/// Per-round accounting shared between the reply layer and its send tool.
#[derive(Default)]
pub struct RoundRecorder {
    pub attempted: AtomicUsize,
    pub succeeded: AtomicUsize,
    pub sent: Mutex<Vec<SentRecord>>,
}

impl RoundRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> usize {
        self.attempted.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> usize {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn take_sent(&self) -> Vec<SentRecord> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

/// The gateway send tool. `target`/`target_type` are force-overwritten by the
/// scheduler; the model cannot redirect a send, and ephemeral tokens never
/// reach the wire.
pub struct SendMessageTool {
    pub gateway: Arc<dyn ChatGateway>,
    pub target: Target,
    pub tokens: EphemeralTokens,
    pub recorder: Arc<RoundRecorder>,
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }
    fn description(&self) -> &str {
        "Send a chat message into the current room."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Message text" },
                "num_chunks": { "type": "integer", "description": "Split into N messages (default 1)" }
            },
            "required": ["content"]
        })
    }
    async fn execute(&self, args: Value) -> ToolResult {
        let Some(content) = arg_str(&args, "content") else {
            return ToolResult::error("missing required parameter: content");
        };
        let content = self.tokens.strip(content);
        if content.trim().is_empty() {
            return ToolResult::error("refusing to send an empty message");
        }
        let num_chunks = args
            .get("num_chunks")
            .and_then(|v| v.as_u64())
            .unwrap_or(1)
            .max(1) as u32;

        self.recorder.attempted.fetch_add(1, Ordering::Relaxed);

        let req = SendRequest {
            target: self.target.id.as_str().to_string(),
            target_type: self.target.kind,
            content: content.clone(),
            num_chunks,
        };
        match self.gateway.send_message(&req).await {
            Ok(outcome) if outcome.success => {
                self.recorder.succeeded.fetch_add(1, Ordering::Relaxed);
                let now_ms = chrono::Utc::now().timestamp_millis();
                let record = SentRecord {
                    message_id: outcome
                        .message_id
                        .unwrap_or_else(|| mingle_core::types::ChatMessage::local_id(now_ms)),
                    content,
                    timestamp: outcome
                        .timestamp
                        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                };
                self.recorder.sent.lock().unwrap().push(record);
                ToolResult::success("message sent")
            }
            Ok(outcome) => ToolResult::error(format!(
                "send failed: {}",
                outcome.error.unwrap_or_else(|| "unknown gateway error".into())
            )),
            Err(e) => ToolResult::error(format!("send failed: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Role tool sets
// ---------------------------------------------------------------------------

/// Tools offered to the observer role: document readers/writers and lookups,
/// never the send tool.
pub fn observer_tools(
    docs: &Arc<SocialWorkspace>,
    state: &Arc<TargetState>,
    agent_can_edit_strategy: bool,
) -> Vec<Arc<dyn Tool>> {
    let target_id = state.id_str().to_string();
    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(GroupRuleReadTool {
            docs: Arc::clone(docs),
            target_id: target_id.clone(),
        }),
        Arc::new(GroupRuleWriteTool {
            docs: Arc::clone(docs),
            target_id: target_id.clone(),
        }),
        Arc::new(SocialMemoryReadTool { docs: Arc::clone(docs) }),
        Arc::new(SocialMemoryWriteTool { docs: Arc::clone(docs) }),
        Arc::new(ReplyStrategyReadTool { docs: Arc::clone(docs) }),
        Arc::new(HistoryQueryTool {
            state: Arc::clone(state),
        }),
        Arc::new(GroupLogQueryTool {
            docs: Arc::clone(docs),
            default_target: target_id,
        }),
    ];
    if agent_can_edit_strategy {
        tools.push(Arc::new(ReplyStrategyWriteTool { docs: Arc::clone(docs) }));
    }
    tools
}

/// Tools offered to the reply role: the send tool plus read-only lookups.
/// Document writers are deliberately absent.
pub fn reply_tools(
    docs: &Arc<SocialWorkspace>,
    state: &Arc<TargetState>,
    gateway: &Arc<dyn ChatGateway>,
    tokens: &EphemeralTokens,
    recorder: &Arc<RoundRecorder>,
) -> Vec<Arc<dyn Tool>> {
    let target_id = state.id_str().to_string();
    vec![
        Arc::new(SendMessageTool {
            gateway: Arc::clone(gateway),
            target: state.target.clone(),
            tokens: tokens.clone(),
            recorder: Arc::clone(recorder),
        }),
        Arc::new(HistoryQueryTool {
            state: Arc::clone(state),
        }),
        Arc::new(GroupLogQueryTool {
            docs: Arc::clone(docs),
            default_target: target_id,
        }),
    ]
}
