#![allow(dead_code)]

use agent::pipeline::{LoopSettings, ToolUseLoop};
use agent::tools::http::HttpToolDispatcher;
use ai::fallback::ModelFallbackPolicy;
use ai::provider::{CompletionProvider, CompletionRequest, CompletionResponse, ContentBlock, Usage};
use async_trait::async_trait;
use chrono::Utc;
use postmate_core::error::{PostmateError, Result};
use postmate_core::types::{
    Account, AccountState, InboundMessage, MessageSummary, OutgoingEmail, ProviderKind,
    ReplyPayload, TransportKind,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::sqlite::SqliteStorage;
use transport::{Mailer, Transport, TransportResolver};

pub fn account() -> Account {
    Account {
        id: 0,
        name: "Acme Support".into(),
        email_address: "support@acme.test".into(),
        state: AccountState::Active,
        transport: TransportKind::InboundApi,
        provider: ProviderKind::Anthropic,
        model: "claude-opus-4-1".into(),
        language: Some("en".into()),
        task: "Answer order questions.".into(),
        company_info: "Acme sells anvils.".into(),
        city: Some("Berlin".into()),
        country: Some("Germany".into()),
        last_polled_at: None,
    }
}

pub fn message(id: &str) -> InboundMessage {
    InboundMessage {
        id: id.into(),
        from: "ann@example.org".into(),
        to: vec!["support@acme.test".into()],
        subject: "Order 42".into(),
        text: "Where is my order?".into(),
        html: String::new(),
        received_at: Utc::now(),
    }
}

pub fn summary(id: &str) -> MessageSummary {
    MessageSummary {
        id: id.into(),
        from: "ann@example.org".into(),
        subject: "Order 42".into(),
        received_at: None,
    }
}

pub fn reply_json(text: &str) -> String {
    json!({
        "EmailResponseText": text,
        "EmailResponseSubject": "RE: Order 42",
        "EmailResponseHtml": format!("<p>{}</p>", text),
        "AiExplanation": "answered",
        "attachments": []
    })
    .to_string()
}

pub fn text_response(text: &str) -> CompletionResponse {
    response(vec![ContentBlock::Text(text.into())])
}

pub fn tool_response(id: &str, name: &str, input: Value) -> CompletionResponse {
    response(vec![ContentBlock::ToolUse {
        id: id.into(),
        name: name.into(),
        input,
    }])
}

pub fn response(content: Vec<ContentBlock>) -> CompletionResponse {
    CompletionResponse {
        content,
        stop_reason: Some("end_turn".into()),
        model: "claude-opus-4-1".into(),
        container_id: Some("cont_1".into()),
        usage: Usage::default(),
    }
}

/// Replays scripted responses and remembers every request.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<CompletionResponse>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
    /// Requests from this index on hang instead of answering.
    stall_from: Mutex<Option<usize>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<CompletionResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            stall_from: Mutex::new(None),
        })
    }

    pub fn stall_from(&self, index: usize) {
        *self.stall_from.lock().unwrap() = Some(index);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len() - 1
        };
        let stall = *self.stall_from.lock().unwrap();
        if stall.is_some_and(|from| index >= from) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PostmateError::AI("script exhausted".into())))
    }

    async fn download_file(&self, file_id: &str, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}.pdf", file_id));
        tokio::fs::write(&path, b"%PDF-1.7").await.unwrap();
        Ok(path)
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<OutgoingEmail>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<()> {
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

/// In-memory mailbox.
#[derive(Default)]
pub struct FakeTransport {
    pub unread: Mutex<Vec<InboundMessage>>,
    pub replies: Mutex<Vec<ReplyPayload>>,
    pub marked_unread: Mutex<Vec<String>>,
    pub failing_sends: AtomicUsize,
    pub mailer: Arc<RecordingMailer>,
}

impl FakeTransport {
    pub fn with_unread(messages: Vec<InboundMessage>) -> Arc<Self> {
        Arc::new(Self {
            unread: Mutex::new(messages),
            ..Default::default()
        })
    }

    pub fn replies(&self) -> Vec<ReplyPayload> {
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn list_unread(&self, _account: &Account) -> Result<Vec<MessageSummary>> {
        Ok(self
            .unread
            .lock()
            .unwrap()
            .iter()
            .map(|m| summary(&m.id))
            .collect())
    }

    async fn fetch(&self, _account: &Account, summary: &MessageSummary) -> Result<InboundMessage> {
        self.unread
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == summary.id)
            .cloned()
            .ok_or_else(|| PostmateError::Transport(format!("no message {}", summary.id)))
    }

    async fn send_reply(
        &self,
        _account: &Account,
        reply: &ReplyPayload,
        _original: &InboundMessage,
        _turn_id: i64,
    ) -> Result<()> {
        if self.failing_sends.load(Ordering::SeqCst) > 0 {
            self.failing_sends.fetch_sub(1, Ordering::SeqCst);
            return Err(PostmateError::Transport("503 Service Unavailable".into()));
        }
        self.replies.lock().unwrap().push(reply.clone());
        Ok(())
    }

    async fn mark_unread(&self, _account: &Account, summary: &MessageSummary) -> Result<()> {
        self.marked_unread.lock().unwrap().push(summary.id.clone());
        Ok(())
    }

    fn mailer(&self, _account: &Account) -> Result<Arc<dyn Mailer>> {
        Ok(self.mailer.clone())
    }
}

pub struct FakeResolver(pub Arc<FakeTransport>);

impl TransportResolver for FakeResolver {
    fn resolve(&self, _kind: TransportKind) -> Result<Arc<dyn Transport>> {
        Ok(self.0.clone())
    }
}

pub fn settings(scratch: &Path) -> LoopSettings {
    LoopSettings {
        max_iterations: 20,
        max_tokens: 8000,
        default_language: "de".into(),
        scratch_dir: scratch.to_path_buf(),
        document_model: None,
    }
}

pub fn tool_loop(
    provider: Arc<ScriptedProvider>,
    storage: Arc<SqliteStorage>,
    fallback: Arc<ModelFallbackPolicy>,
    settings: LoopSettings,
) -> ToolUseLoop {
    let dispatcher = Arc::new(HttpToolDispatcher::new(
        reqwest::Client::new(),
        storage,
        51_200,
    ));
    ToolUseLoop::new(provider, fallback, dispatcher, settings).unwrap()
}

pub fn fallback() -> Arc<ModelFallbackPolicy> {
    Arc::new(ModelFallbackPolicy::new("opus", "claude-sonnet-4-5"))
}
