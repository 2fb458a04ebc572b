use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::types::{
    BackendError, ChatRequest, ChatResponse, HistoryItem, LlmBackend, Part, Role, ToolCall, Turn,
};

/// Back-end for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    backend_name: String,
    /// Path appended to base_url. Default: "/v1/chat/completions".
    chat_path: String,
}

impl OpenAiCompatBackend {
    pub fn new(client: reqwest::Client, api_key: String, base_url: String) -> Self {
        Self::with_path(client, "openai-compatible", api_key, base_url, "/v1/chat/completions")
    }

    pub fn with_path(
        client: reqwest::Client,
        name: impl Into<String>,
        api_key: String,
        base_url: String,
        chat_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            backend_name: name.into(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_path: chat_path.into(),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.backend_name
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, BackendError> {
        let body = build_request_body(req);
        let url = format!("{}{}", self.base_url, self.chat_path);

        debug!(model = %req.model, "sending chat-completions request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(BackendError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "chat-completions API error");
            return Err(BackendError::Api {
                status,
                message: text,
            });
        }

        let api_resp: Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        parse_response(&api_resp, &req.model)
    }
}

pub(crate) fn build_request_body(req: &ChatRequest) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": req.system })];
    for item in &req.history {
        render_item(item, &mut messages);
    }

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": false,
    });

    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

fn render_item(item: &HistoryItem, messages: &mut Vec<Value>) {
    match item {
        HistoryItem::Turn(turn) => messages.push(render_turn(turn)),
        HistoryItem::ToolCalls { text, calls } => {
            let tool_calls: Vec<Value> = calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.args.to_string(),
                        }
                    })
                })
                .collect();
            let content = if text.is_empty() {
                Value::Null
            } else {
                json!(text)
            };
            messages.push(json!({
                "role": "assistant",
                "content": content,
                "tool_calls": tool_calls,
            }));
        }
        HistoryItem::ToolResults(outcomes) => {
            let mut images: Vec<Part> = Vec::new();
            for outcome in outcomes {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": outcome.call_id,
                    "content": outcome.content,
                }));
                images.extend(outcome.images.iter().cloned());
            }
            // Tool-role messages cannot carry images; attach them as a
            // follow-up user turn instead.
            if !images.is_empty() {
                messages.push(render_turn(&Turn {
                    role: Role::User,
                    parts: images,
                }));
            }
        }
    }
}

fn render_turn(turn: &Turn) -> Value {
    let role = match turn.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    if !turn.has_images() {
        return json!({ "role": role, "content": turn.text() });
    }
    let parts: Vec<Value> = turn
        .parts
        .iter()
        .map(|p| match p {
            Part::Text(t) => json!({ "type": "text", "text": t }),
            Part::Image { data, mime } => json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{mime};base64,{data}") }
            }),
        })
        .collect();
    json!({ "role": role, "content": parts })
}

fn parse_response(api_resp: &Value, model: &str) -> Result<ChatResponse, BackendError> {
    let message = api_resp
        .pointer("/choices/0/message")
        .ok_or_else(|| BackendError::Parse("response has no choices[0].message".into()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let args_raw = c
                        .pointer("/function/arguments")
                        .and_then(|a| a.as_str())
                        .unwrap_or("{}");
                    ToolCall {
                        id: c
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or(&format!("call_{i}"))
                            .to_string(),
                        name: c
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        args: serde_json::from_str(args_raw).unwrap_or_else(|_| json!({})),
                        thought_signature: None,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        tool_calls,
        model: api_resp
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(model)
            .to_string(),
        tokens_in: api_resp
            .pointer("/usage/prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        tokens_out: api_resp
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        stop_reason: api_resp
            .pointer("/choices/0/finish_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
    })
}
