//! Scripted collaborators for scheduler scenarios: a fake chat gateway, a
//! fake LLM back-end, and a no-op tool bridge.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use mingle_core::config::SocialConfig;
use mingle_core::types::{Target, TargetKind};
use mingle_docs::SocialWorkspace;
use mingle_engine::runtime::{EngineDeps, Runtime};
use mingle_gateway::{
    BridgeError, ChatGateway, GatewayError, GatewayMessage, SendOutcome, SendRequest, TargetBlock,
    ToolBridge,
};
use mingle_llm::{
    BackendError, ChatRequest, ChatResponse, LlmBackend, ToolCall, ToolDefinition,
};

// ---------------------------------------------------------------------------
// Fake gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeGateway {
    /// Scripted batch results; an exhausted script returns empty rounds.
    pub batches: Mutex<VecDeque<Vec<TargetBlock>>>,
    /// Scripted send outcomes; an exhausted script succeeds.
    pub send_results: Mutex<VecDeque<SendOutcome>>,
    /// Every send request, in order.
    pub sends: Mutex<Vec<SendRequest>>,
    pub compress_calls: AtomicUsize,
    send_seq: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_batch(&self, blocks: Vec<TargetBlock>) {
        self.batches.lock().unwrap().push_back(blocks);
    }

    pub fn push_send_result(&self, outcome: SendOutcome) {
        self.send_results.lock().unwrap().push_back(outcome);
    }

    pub fn sent_contents(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.content.clone())
            .collect()
    }
}

#[async_trait]
impl ChatGateway for FakeGateway {
    async fn batch_recent(
        &self,
        _targets: &[Target],
        _limit: u32,
    ) -> Result<Vec<TargetBlock>, GatewayError> {
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn send_message(&self, req: &SendRequest) -> Result<SendOutcome, GatewayError> {
        self.sends.lock().unwrap().push(req.clone());
        let scripted = self.send_results.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| {
            let n = self.send_seq.fetch_add(1, Ordering::Relaxed);
            SendOutcome {
                success: true,
                message_id: Some(format!("srv_{n}")),
                timestamp: Some(format!("2026-01-01T01:00:{n:02}Z")),
                error: None,
            }
        }))
    }

    async fn compress_context(&self, _target: &Target) -> Result<(), GatewayError> {
        self.compress_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake back-end
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeBackend {
    pub responses: Mutex<VecDeque<Result<ChatResponse, String>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_text(&self, content: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(text_response(content)));
    }

    pub fn push_tool_call(&self, name: &str, args: Value) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(tool_call_response(name, args)));
    }

    pub fn push_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, BackendError> {
        self.requests.lock().unwrap().push(req.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(message)) => Err(BackendError::Api {
                status: 500,
                message,
            }),
            None => Err(BackendError::Parse("backend script exhausted".into())),
        }
    }
}

pub fn text_response(content: &str) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        tool_calls: vec![],
        model: "fake-model".into(),
        tokens_in: 0,
        tokens_out: 0,
        stop_reason: "stop".into(),
    }
}

pub fn tool_call_response(name: &str, args: Value) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: "call_1".into(),
            name: name.to_string(),
            args,
            thought_signature: None,
        }],
        model: "fake-model".into(),
        tokens_in: 0,
        tokens_out: 0,
        stop_reason: "tool_use".into(),
    }
}

// ---------------------------------------------------------------------------
// Fake bridge
// ---------------------------------------------------------------------------

pub struct FakeBridge;

#[async_trait]
impl ToolBridge for FakeBridge {
    fn has_server(&self, _name: &str) -> bool {
        true
    }

    async fn list_tools(&self, _server: &str) -> Result<Vec<ToolDefinition>, BridgeError> {
        Ok(vec![])
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

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn config(groups: &[&str]) -> SocialConfig {
    serde_json::from_value(serde_json::json!({
        "assistant_id": "pet-1",
        "gateway_server": "chat-bridge",
        "provider_id": "p1",
        "model": "fake-model",
        "self_id": "10001",
        "agent_name": "小明",
        "watched_groups": groups,
    }))
    .expect("test config")
}

pub fn gw_msg(id: &str, seq: u32, content: &str, is_at_me: bool) -> GatewayMessage {
    GatewayMessage {
        message_id: id.to_string(),
        timestamp: format!("2026-01-01T00:{:02}:{:02}Z", seq / 60, seq % 60),
        sender_id: "u1".into(),
        sender_name: "群友甲".into(),
        content: content.to_string(),
        is_at_me,
        is_self: false,
        image_urls: vec![],
    }
}

pub fn block(target: &str, messages: Vec<GatewayMessage>) -> TargetBlock {
    TargetBlock {
        target: target.to_string(),
        target_type: TargetKind::Group,
        group_name: Some(format!("{target}-room")),
        friend_name: None,
        compressed_summary: None,
        message_count: Some(messages.len() as u32),
        error: None,
        messages,
    }
}

/// A detached runtime wired to fresh fakes and a tempdir workspace.
pub struct Harness {
    pub rt: Arc<Runtime>,
    pub gateway: Arc<FakeGateway>,
    pub backend: Arc<FakeBackend>,
    pub docs: Arc<SocialWorkspace>,
    _tmp: tempfile::TempDir,
}

pub fn harness(groups: &[&str]) -> Harness {
    harness_with_config(config(groups))
}

pub fn harness_with_config(config: SocialConfig) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let docs = Arc::new(SocialWorkspace::new(tmp.path()));
    let gateway = FakeGateway::new();
    let backend = FakeBackend::new();
    let deps = EngineDeps {
        gateway: gateway.clone(),
        backend: backend.clone(),
        bridge: Arc::new(FakeBridge),
        docs: Arc::clone(&docs),
        http: reqwest::Client::new(),
    };
    let rt = Runtime::detached(config, deps);
    Harness {
        rt,
        gateway,
        backend,
        docs,
        _tmp: tmp,
    }
}
