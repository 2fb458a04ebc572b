use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use mingle_core::types::Target;
use mingle_llm::ToolDefinition;

use crate::types::{
    ChatGateway, GatewayError, RecentBatch, SendOutcome, SendRequest, TargetBlock,
};

/// A tool exposed by an external tool server.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    pub server: String,
    pub def: ToolDefinition,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("tool server \"{0}\" not found")]
    ServerNotFound(String),

    #[error("tool call failed: {0}")]
    Call(String),

    #[error("tool call timed out")]
    Timeout,
}

/// The external tool bridge the embedding host supplies.
///
/// It owns tool-server lifecycles and transports one call at a time; this
/// crate only needs request/response semantics.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    fn has_server(&self, name: &str) -> bool;

    /// Tools a server advertises, for building the LLM tool list.
    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDefinition>, BridgeError>;

    /// Invoke one tool and return its raw result payload.
    async fn call_tool(&self, server: &str, tool: &str, args: Value)
        -> Result<Value, BridgeError>;
}

/// `ChatGateway` implementation that speaks to the gateway tool server
/// through the bridge.
pub struct BridgeGateway {
    bridge: std::sync::Arc<dyn ToolBridge>,
    server: String,
}

impl BridgeGateway {
    pub fn new(bridge: std::sync::Arc<dyn ToolBridge>, server: impl Into<String>) -> Self {
        Self {
            bridge,
            server: server.into(),
        }
    }

    async fn call(&self, tool: &str, args: Value) -> Result<Value, GatewayError> {
        let raw = self
            .bridge
            .call_tool(&self.server, tool, args)
            .await
            .map_err(|e| match e {
                BridgeError::Timeout => GatewayError::Timeout,
                other => GatewayError::Call(other.to_string()),
            })?;
        Ok(unwrap_tool_payload(raw))
    }
}

#[async_trait]
impl ChatGateway for BridgeGateway {
    async fn batch_recent(
        &self,
        targets: &[Target],
        limit: u32,
    ) -> Result<Vec<TargetBlock>, GatewayError> {
        let wire_targets: Vec<Value> = targets
            .iter()
            .map(|t| json!({ "target": t.id.as_str(), "target_type": t.kind }))
            .collect();

        let payload = self
            .call(
                "batch_get_recent_context",
                json!({ "targets": wire_targets, "limit": limit }),
            )
            .await?;

        let batch: RecentBatch = serde_json::from_value(payload)
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        debug!(blocks = batch.results.len(), "batch context received");
        Ok(batch.results)
    }

    async fn send_message(&self, req: &SendRequest) -> Result<SendOutcome, GatewayError> {
        let payload = self
            .call(
                "send_message",
                serde_json::to_value(req).map_err(|e| GatewayError::Parse(e.to_string()))?,
            )
            .await?;
        serde_json::from_value(payload).map_err(|e| GatewayError::Parse(e.to_string()))
    }

    async fn compress_context(&self, target: &Target) -> Result<(), GatewayError> {
        if let Err(e) = self
            .call(
                "compress_context",
                json!({ "target": target.id.as_str(), "target_type": target.kind }),
            )
            .await
        {
            warn!(target = %target, error = %e, "compress_context request failed");
            return Err(e);
        }
        Ok(())
    }
}

/// Tool servers wrap results as `{content: [{type: "text", text: <json>}]}`.
/// Unwrap that envelope when present; otherwise the payload is already bare.
fn unwrap_tool_payload(raw: Value) -> Value {
    let Some(items) = raw.get("content").and_then(|c| c.as_array()) else {
        return raw;
    };
    let Some(text) = items.iter().find_map(|item| {
        (item.get("type").and_then(|t| t.as_str()) == Some("text"))
            .then(|| item.get("text").and_then(|t| t.as_str()))
            .flatten()
    }) else {
        return raw;
    };
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
