use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::types::{
    BackendError, ChatRequest, ChatResponse, HistoryItem, LlmBackend, Part, Role, ToolCall, Turn,
};

/// Back-end for the official Gemini `generateContent` API.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(client: reqwest::Client, api_key: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini-official"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, BackendError> {
        let body = build_request_body(req);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, req.model
        );

        debug!(model = %req.model, "sending generateContent request");

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(BackendError::RateLimited {
                retry_after_ms: 5000,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "generateContent API error");
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
    let mut contents: Vec<Value> = Vec::new();
    for item in clean_history(&req.history) {
        render_item(item, &mut contents);
    }

    let mut generation_config = json!({ "maxOutputTokens": req.max_tokens });
    if let Some(t) = req.temperature {
        generation_config["temperature"] = json!(t);
    }

    let mut body = json!({
        "systemInstruction": { "parts": [{ "text": req.system }] },
        "contents": contents,
        "generationConfig": generation_config,
    });

    if !req.tools.is_empty() {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    body
}

/// The functionResponse replay path rejects prior function calls without a
/// `thoughtSignature`. Drop such `ToolCalls` items together with the results
/// that answer them.
pub(crate) fn clean_history(history: &[HistoryItem]) -> Vec<&HistoryItem> {
    let mut out: Vec<&HistoryItem> = Vec::new();
    let mut skip_results = false;
    for item in history {
        match item {
            HistoryItem::ToolCalls { calls, .. } => {
                if calls.iter().any(|c| c.thought_signature.is_none()) {
                    skip_results = true;
                    continue;
                }
                skip_results = false;
                out.push(item);
            }
            HistoryItem::ToolResults(_) if skip_results => {
                skip_results = false;
            }
            _ => {
                skip_results = false;
                out.push(item);
            }
        }
    }
    out
}

fn render_item(item: &HistoryItem, contents: &mut Vec<Value>) {
    match item {
        HistoryItem::Turn(turn) => contents.push(render_turn(turn)),
        HistoryItem::ToolCalls { text, calls } => {
            let mut parts: Vec<Value> = Vec::new();
            if !text.is_empty() {
                parts.push(json!({ "text": text }));
            }
            for call in calls {
                let mut part = json!({
                    "functionCall": { "name": call.name, "args": call.args }
                });
                if let Some(sig) = &call.thought_signature {
                    part["thoughtSignature"] = json!(sig);
                }
                parts.push(part);
            }
            contents.push(json!({ "role": "model", "parts": parts }));
        }
        HistoryItem::ToolResults(outcomes) => {
            let parts: Vec<Value> = outcomes
                .iter()
                .map(|o| {
                    json!({
                        "functionResponse": {
                            "name": o.name,
                            "response": { "result": o.content },
                        }
                    })
                })
                .collect();
            contents.push(json!({ "role": "user", "parts": parts }));

            // functionResponse parts reject inline data; image payloads ride
            // in a separate subsequent user message.
            let images: Vec<Part> = outcomes
                .iter()
                .flat_map(|o| o.images.iter().cloned())
                .collect();
            if !images.is_empty() {
                contents.push(render_turn(&Turn {
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
        Role::Assistant => "model",
    };
    let parts: Vec<Value> = turn
        .parts
        .iter()
        .map(|p| match p {
            Part::Text(t) => json!({ "text": t }),
            Part::Image { data, mime } => json!({
                "inlineData": { "mimeType": mime, "data": data }
            }),
        })
        .collect();
    json!({ "role": role, "parts": parts })
}

fn parse_response(api_resp: &Value, model: &str) -> Result<ChatResponse, BackendError> {
    let parts = api_resp
        .pointer("/candidates/0/content/parts")
        .and_then(|v| v.as_array())
        .ok_or_else(|| BackendError::Parse("response has no candidates[0].content.parts".into()))?;

    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for part in parts {
        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
            content.push_str(text);
        }
        if let Some(call) = part.get("functionCall") {
            tool_calls.push(ToolCall {
                id: format!("call_{}", tool_calls.len()),
                name: call
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                args: call.get("args").cloned().unwrap_or_else(|| json!({})),
                thought_signature: part
                    .get("thoughtSignature")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            });
        }
    }

    Ok(ChatResponse {
        content,
        tool_calls,
        model: model.to_string(),
        tokens_in: api_resp
            .pointer("/usageMetadata/promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        tokens_out: api_resp
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        stop_reason: api_resp
            .pointer("/candidates/0/finishReason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
    })
}
