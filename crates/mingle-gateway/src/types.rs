use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mingle_core::types::{ChatMessage, ImageRef, Target, TargetKind};

/// A message as the gateway reports it. Image attachments arrive as gateway
/// URLs and stay URLs until prompt-assembly time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub message_id: String,
    pub timestamp: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    #[serde(default)]
    pub is_at_me: bool,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

impl From<GatewayMessage> for ChatMessage {
    fn from(m: GatewayMessage) -> Self {
        ChatMessage {
            message_id: Some(m.message_id),
            timestamp: m.timestamp,
            sender_id: m.sender_id,
            sender_name: m.sender_name,
            content: m.content,
            is_at_me: m.is_at_me,
            is_self: m.is_self,
            images: m
                .image_urls
                .into_iter()
                .map(|url| ImageRef {
                    data: url,
                    mime: "image/png".to_string(),
                })
                .collect(),
        }
    }
}

/// One per-target result block of a batched pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetBlock {
    pub target: String,
    pub target_type: TargetKind,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub friend_name: Option<String>,
    #[serde(default)]
    pub compressed_summary: Option<String>,
    #[serde(default)]
    pub message_count: Option<u32>,
    /// Non-empty = this target failed this round; others are unaffected.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub messages: Vec<GatewayMessage>,
}

impl TargetBlock {
    pub fn display_name(&self) -> Option<&str> {
        self.group_name
            .as_deref()
            .or(self.friend_name.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Result of one `batch_get_recent_context` round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecentBatch {
    #[serde(default)]
    pub results: Vec<TargetBlock>,
}

/// Outbound send. The engine force-overwrites `target`/`target_type` and
/// strips ephemeral tokens from `content` before this struct is built.
#[derive(Debug, Clone, Serialize)]
pub struct SendRequest {
    pub target: String,
    pub target_type: TargetKind,
    pub content: String,
    pub num_chunks: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendOutcome {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway call failed: {0}")]
    Call(String),

    #[error("gateway reply unparseable: {0}")]
    Parse(String),

    #[error("gateway call timed out")]
    Timeout,
}

/// The three RPCs the engine depends on.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Batched pull of recent context for every configured target.
    async fn batch_recent(
        &self,
        targets: &[Target],
        limit: u32,
    ) -> Result<Vec<TargetBlock>, GatewayError>;

    async fn send_message(&self, req: &SendRequest) -> Result<SendOutcome, GatewayError>;

    /// Fire-and-forget: ask the gateway to refresh its rolling summary.
    async fn compress_context(&self, target: &Target) -> Result<(), GatewayError>;
}
