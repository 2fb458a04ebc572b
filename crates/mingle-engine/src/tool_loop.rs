//! The LLM tool-loop driver.
//!
//! One logical LLM call may take several request/response cycles: the model
//! requests tools, the driver dispatches them (built-in executor or the
//! external bridge), feeds results back, and loops until the model produces
//! plain text or the iteration bound is hit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mingle_gateway::{ExternalTool, ToolBridge};
use mingle_llm::{
    BackendError, ChatRequest, ChatResponse, HistoryItem, LlmBackend, ToolOutcome, Turn,
};

use crate::tools::{to_definitions, Tool};
use crate::{DEFAULT_SERVER_ITERATION_CAP, MAX_TOTAL_ITERATIONS};

/// Built-in tools answer quickly; anything slower is a bug.
const BUILTIN_TOOL_TIMEOUT: Duration = Duration::from_secs(60);
/// External tool servers may do real work (searches, downloads).
const EXTERNAL_TOOL_TIMEOUT: Duration = Duration::from_secs(300);
/// Pseudo-server key under which built-in tool calls are counted.
const BUILTIN_SERVER_KEY: &str = "builtin";

/// Rewrites tool arguments before dispatch. Reply uses this to force-override
/// send targets and strip ephemeral tokens from any content.
pub type ArgTransform = dyn Fn(&str, Value) -> Value + Send + Sync;

pub struct ToolLoopRequest {
    pub model: String,
    pub system: String,
    pub turns: Vec<Turn>,
    pub builtin: Vec<Arc<dyn Tool>>,
    pub external: Vec<ExternalTool>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

pub struct ToolLoopOutcome {
    pub response: ChatResponse,
    pub iterations: usize,
    pub tool_calls: usize,
}

pub async fn run_tool_loop(
    backend: &dyn LlmBackend,
    bridge: &Arc<dyn ToolBridge>,
    req: ToolLoopRequest,
    caps: &HashMap<String, Option<u32>>,
    cancel: &CancellationToken,
    arg_transform: Option<&ArgTransform>,
) -> Result<ToolLoopOutcome, BackendError> {
    let mut tool_defs = to_definitions(&req.builtin);
    tool_defs.extend(req.external.iter().map(|t| t.def.clone()));

    let mut history: Vec<HistoryItem> = req.turns.into_iter().map(HistoryItem::Turn).collect();
    let mut server_counts: HashMap<String, u32> = HashMap::new();
    let mut total_tool_calls = 0usize;
    let mut last_response: Option<ChatResponse> = None;

    for iteration in 1..=MAX_TOTAL_ITERATIONS {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let chat_req = ChatRequest {
            model: req.model.clone(),
            system: req.system.clone(),
            history: history.clone(),
            tools: tool_defs.clone(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        };

        debug!(iteration, "tool loop iteration");
        let response = backend.send(&chat_req).await?;

        if response.tool_calls.is_empty() {
            return Ok(ToolLoopOutcome {
                response,
                iterations: iteration,
                tool_calls: total_tool_calls,
            });
        }

        history.push(HistoryItem::ToolCalls {
            text: response.content.clone(),
            calls: response.tool_calls.clone(),
        });

        let mut outcomes: Vec<ToolOutcome> = Vec::with_capacity(response.tool_calls.len());
        for call in &response.tool_calls {
            total_tool_calls += 1;
            let args = match arg_transform {
                Some(transform) => transform(&call.name, call.args.clone()),
                None => call.args.clone(),
            };
            let outcome = dispatch(
                &call.id,
                &call.name,
                args,
                &req.builtin,
                &req.external,
                bridge,
                caps,
                &mut server_counts,
                cancel,
            )
            .await?;
            outcomes.push(outcome);
        }
        history.push(HistoryItem::ToolResults(outcomes));

        last_response = Some(response);
    }

    warn!(
        max_iterations = MAX_TOTAL_ITERATIONS,
        "tool loop hit the iteration bound"
    );
    match last_response {
        Some(response) => Ok(ToolLoopOutcome {
            response,
            iterations: MAX_TOTAL_ITERATIONS,
            tool_calls: total_tool_calls,
        }),
        None => Err(BackendError::Parse(format!(
            "tool loop exceeded {MAX_TOTAL_ITERATIONS} iterations without a final response"
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    call_id: &str,
    name: &str,
    args: Value,
    builtin: &[Arc<dyn Tool>],
    external: &[ExternalTool],
    bridge: &Arc<dyn ToolBridge>,
    caps: &HashMap<String, Option<u32>>,
    server_counts: &mut HashMap<String, u32>,
    cancel: &CancellationToken,
) -> Result<ToolOutcome, BackendError> {
    if let Some(tool) = builtin.iter().find(|t| t.name() == name) {
        if let Some(skip) = over_cap(BUILTIN_SERVER_KEY, caps, server_counts) {
            return Ok(error_outcome(call_id, name, skip));
        }
        let execution = tool.execute(args);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            res = tokio::time::timeout(BUILTIN_TOOL_TIMEOUT, execution) => res,
        };
        return Ok(match result {
            Ok(r) => ToolOutcome {
                call_id: call_id.to_string(),
                name: name.to_string(),
                content: r.content,
                is_error: r.is_error,
                images: r.images,
            },
            Err(_) => error_outcome(call_id, name, "tool timed out".into()),
        });
    }

    if let Some(ext) = external.iter().find(|t| t.def.name == name) {
        if let Some(skip) = over_cap(&ext.server, caps, server_counts) {
            return Ok(error_outcome(call_id, name, skip));
        }
        let call = bridge.call_tool(&ext.server, name, args);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            res = tokio::time::timeout(EXTERNAL_TOOL_TIMEOUT, call) => res,
        };
        return Ok(match result {
            Ok(Ok(value)) => ToolOutcome {
                call_id: call_id.to_string(),
                name: name.to_string(),
                content: payload_to_text(value),
                is_error: false,
                images: Vec::new(),
            },
            Ok(Err(e)) => error_outcome(call_id, name, format!("tool call failed: {e}")),
            Err(_) => error_outcome(call_id, name, "tool timed out".into()),
        });
    }

    // Unknown names are rejected with a structured error the model can read.
    Ok(error_outcome(
        call_id,
        name,
        format!("unknown tool: {name}"),
    ))
}

/// Count one call against the server; returns a skip-error message when the
/// cap is exceeded. A configured `null` means unlimited.
fn over_cap(
    server: &str,
    caps: &HashMap<String, Option<u32>>,
    server_counts: &mut HashMap<String, u32>,
) -> Option<String> {
    let cap = match caps.get(server) {
        Some(None) => return increment_and_pass(server, server_counts),
        Some(Some(n)) => *n,
        None => DEFAULT_SERVER_ITERATION_CAP,
    };
    let count = server_counts.entry(server.to_string()).or_insert(0);
    *count += 1;
    if *count > cap {
        Some(format!(
            "tool call skipped: server \"{server}\" exceeded its {cap}-call limit for this round"
        ))
    } else {
        None
    }
}

fn increment_and_pass(server: &str, server_counts: &mut HashMap<String, u32>) -> Option<String> {
    *server_counts.entry(server.to_string()).or_insert(0) += 1;
    None
}

fn error_outcome(call_id: &str, name: &str, message: String) -> ToolOutcome {
    ToolOutcome {
        call_id: call_id.to_string(),
        name: name.to_string(),
        content: message,
        is_error: true,
        images: Vec::new(),
    }
}

fn payload_to_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use mingle_gateway::BridgeError;
    use mingle_llm::{ToolCall, ToolDefinition};

    use crate::tools::ToolResult;

    struct ScriptedBackend {
        responses: Mutex<VecDeque<ChatResponse>>,
        seen_requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                seen_requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, BackendError> {
            self.seen_requests.lock().unwrap().push(req.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| BackendError::Parse("script exhausted".into()))
        }
    }

    struct NoBridge;

    #[async_trait]
    impl ToolBridge for NoBridge {
        fn has_server(&self, _name: &str) -> bool {
            false
        }
        async fn list_tools(&self, server: &str) -> Result<Vec<ToolDefinition>, BridgeError> {
            Err(BridgeError::ServerNotFound(server.to_string()))
        }
        async fn call_tool(
            &self,
            server: &str,
            _tool: &str,
            _args: Value,
        ) -> Result<Value, BridgeError> {
            Err(BridgeError::ServerNotFound(server.to_string()))
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo input back"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object", "properties": { "text": { "type": "string" } } })
        }
        async fn execute(&self, args: Value) -> ToolResult {
            ToolResult::success(args["text"].as_str().unwrap_or("").to_string())
        }
    }

    fn text_response(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            tool_calls: vec![],
            model: "m".into(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: "stop".into(),
        }
    }

    fn tool_response(name: &str, args: Value) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                name: name.into(),
                args,
                thought_signature: None,
            }],
            model: "m".into(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: "tool_use".into(),
        }
    }

    fn loop_request(builtin: Vec<Arc<dyn Tool>>) -> ToolLoopRequest {
        ToolLoopRequest {
            model: "m".into(),
            system: "sys".into(),
            turns: vec![Turn::user("hi")],
            builtin,
            external: vec![],
            max_tokens: 512,
            temperature: None,
        }
    }

    #[tokio::test]
    async fn executes_tool_then_returns_final_text() {
        let backend = ScriptedBackend::new(vec![
            tool_response("echo", json!({ "text": "ping" })),
            text_response("done"),
        ]);
        let bridge: Arc<dyn ToolBridge> = Arc::new(NoBridge);
        let outcome = run_tool_loop(
            &backend,
            &bridge,
            loop_request(vec![Arc::new(EchoTool)]),
            &HashMap::new(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.response.content, "done");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls, 1);

        // The second request must carry the tool call and its result.
        let seen = backend.seen_requests.lock().unwrap();
        assert!(matches!(seen[1].history[1], HistoryItem::ToolCalls { .. }));
        match &seen[1].history[2] {
            HistoryItem::ToolResults(results) => {
                assert_eq!(results[0].content, "ping");
                assert!(!results[0].is_error);
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_names_are_rejected_but_loop_continues() {
        let backend = ScriptedBackend::new(vec![
            tool_response("no_such_tool", json!({})),
            text_response("recovered"),
        ]);
        let bridge: Arc<dyn ToolBridge> = Arc::new(NoBridge);
        let outcome = run_tool_loop(
            &backend,
            &bridge,
            loop_request(vec![Arc::new(EchoTool)]),
            &HashMap::new(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.response.content, "recovered");
        let seen = backend.seen_requests.lock().unwrap();
        match &seen[1].history[2] {
            HistoryItem::ToolResults(results) => {
                assert!(results[0].is_error);
                assert!(results[0].content.contains("unknown tool"));
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_cap_skips_excess_calls() {
        let mut responses = vec![];
        for _ in 0..3 {
            responses.push(tool_response("echo", json!({ "text": "x" })));
        }
        responses.push(text_response("end"));
        let backend = ScriptedBackend::new(responses);
        let bridge: Arc<dyn ToolBridge> = Arc::new(NoBridge);

        let mut caps = HashMap::new();
        caps.insert("builtin".to_string(), Some(2));

        let outcome = run_tool_loop(
            &backend,
            &bridge,
            loop_request(vec![Arc::new(EchoTool)]),
            &caps,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.tool_calls, 3);

        let seen = backend.seen_requests.lock().unwrap();
        // Third tool result must be the skip error.
        match &seen[3].history[6] {
            HistoryItem::ToolResults(results) => {
                assert!(results[0].is_error);
                assert!(results[0].content.contains("limit"));
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn arg_transform_rewrites_before_dispatch() {
        let backend = ScriptedBackend::new(vec![
            tool_response("echo", json!({ "text": "original" })),
            text_response("done"),
        ]);
        let bridge: Arc<dyn ToolBridge> = Arc::new(NoBridge);
        let transform = |_name: &str, mut args: Value| {
            args["text"] = json!("rewritten");
            args
        };
        let outcome = run_tool_loop(
            &backend,
            &bridge,
            loop_request(vec![Arc::new(EchoTool)]),
            &HashMap::new(),
            &CancellationToken::new(),
            Some(&transform),
        )
        .await
        .unwrap();
        assert_eq!(outcome.response.content, "done");

        let seen = backend.seen_requests.lock().unwrap();
        match &seen[1].history[2] {
            HistoryItem::ToolResults(results) => assert_eq!(results[0].content, "rewritten"),
            other => panic!("expected tool results, got {other:?}"),
        }
    }
}
