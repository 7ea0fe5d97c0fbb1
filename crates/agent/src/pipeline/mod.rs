//! The tool-use loop that turns one inbound message into a reply.

pub mod attachments;
pub mod document;

use crate::prompt::PromptBuilder;
use crate::tools::http::HttpToolDispatcher;
use crate::tools::ToolRegistry;
use ai::fallback::ModelFallbackPolicy;
use ai::language::country_code;
use ai::provider::{
    CompletionProvider, CompletionRequest, ContentBlock, DocumentSkill, Message,
    NativeCapability, Role,
};
use ai::schema::{ParseContext, ResponseParser};
use attachments::{content_type_for, read_attachment, resolve_attachments};
use document::{DocumentGenerator, NOTE_NOT_CREATED, NOTE_TECHNICAL_ERROR};
use postmate_core::error::{PostmateError, Result};
use postmate_core::types::{file_name_of, Account, InboundMessage, ReplyPayload, ToolDefinition};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use transport::Transport;
use uuid::Uuid;

const WEB_SEARCH_MAX_USES: u32 = 5;

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub default_language: String,
    pub scratch_dir: PathBuf,
    /// Model for document generation; the turn's model when unset.
    pub document_model: Option<String>,
}

/// Everything the loop needs to know about the message being answered.
pub struct TurnContext<'a> {
    pub account: &'a Account,
    pub message: &'a InboundMessage,
    pub turn_id: i64,
    pub tools: &'a [ToolDefinition],
    pub transport: &'a dyn Transport,
}

/// Addresses the mail tools delivered to during a turn. Owned by the caller,
/// so it is still readable after the loop was cancelled.
#[derive(Debug, Default)]
pub struct Outbox {
    recipients: Mutex<Vec<String>>,
}

impl Outbox {
    pub fn record(&self, recipient: &str) {
        let mut recipients = self.recipients.lock().unwrap_or_else(|p| p.into_inner());
        recipients.push(recipient.to_string());
    }

    pub fn recipients(&self) -> Vec<String> {
        self.recipients.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }
}

/// Tools and prompts for a message, built before its turn is stored.
pub struct PreparedTurn {
    registry: ToolRegistry,
    system: String,
    user: String,
}

impl PreparedTurn {
    /// System and user prompt as they are sent.
    pub fn prompt(&self) -> String {
        format!("{}\n\n{}", self.system, self.user)
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// System and user prompt as sent, kept on the turn.
    pub prompt: String,
    pub payload: ReplyPayload,
}

pub struct ToolUseLoop {
    provider: Arc<dyn CompletionProvider>,
    fallback: Arc<ModelFallbackPolicy>,
    dispatcher: Arc<HttpToolDispatcher>,
    parser: ResponseParser,
    documents: DocumentGenerator,
    settings: LoopSettings,
}

impl ToolUseLoop {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        fallback: Arc<ModelFallbackPolicy>,
        dispatcher: Arc<HttpToolDispatcher>,
        settings: LoopSettings,
    ) -> Result<Self> {
        Ok(Self {
            documents: DocumentGenerator::new(provider.clone(), settings.max_tokens),
            provider,
            fallback,
            dispatcher,
            parser: ResponseParser::new()?,
            settings,
        })
    }

    pub fn prepare(
        &self,
        account: &Account,
        message: &InboundMessage,
        tools: &[ToolDefinition],
        transport: &dyn Transport,
    ) -> Result<PreparedTurn> {
        let registry = ToolRegistry::build(account, tools, transport, self.dispatcher.clone())?;
        let prompts = PromptBuilder::new(account, &self.settings.default_language);
        let system = prompts.system(message, registry.has_mail_tools(), &registry.http_tools());
        let user = prompts.user(message);
        Ok(PreparedTurn {
            registry,
            system,
            user,
        })
    }

    pub async fn run(&self, ctx: TurnContext<'_>) -> Result<LoopOutcome> {
        let prepared = self.prepare(ctx.account, ctx.message, ctx.tools, ctx.transport)?;
        self.run_prepared(&ctx, prepared, &Outbox::default()).await
    }

    /// Runs the loop for an already prepared turn. Every delivery a mail tool
    /// makes is recorded in `outbox` as it happens.
    pub async fn run_prepared(
        &self,
        ctx: &TurnContext<'_>,
        prepared: PreparedTurn,
        outbox: &Outbox,
    ) -> Result<LoopOutcome> {
        let account = ctx.account;
        let PreparedTurn {
            registry,
            system,
            user,
        } = prepared;
        let model = self.fallback.resolve_model(&account.model);
        let capabilities = account_capabilities(account);

        let scratch = self
            .settings
            .scratch_dir
            .join(format!("{}-{}", ctx.turn_id, Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| PostmateError::Internal(format!("{}: {}", scratch.display(), e)))?;

        info!(
            account_id = account.id,
            turn_id = ctx.turn_id,
            "Starting tool-use loop with {} and {} tools",
            model,
            registry.specs().len()
        );

        let mut messages = vec![Message::user_text(user.clone())];
        let mut container_id: Option<String> = None;
        let mut downloaded: Vec<PathBuf> = Vec::new();
        let mut all_text = String::new();
        let mut final_text = String::new();
        let mut finished = false;

        for iteration in 1..=self.settings.max_iterations {
            let request = CompletionRequest {
                model: model.clone(),
                system: system.clone(),
                messages: messages.clone(),
                tools: registry.specs().to_vec(),
                capabilities: capabilities.clone(),
                max_tokens: self.settings.max_tokens,
                container_id: container_id.clone(),
            };

            let response = match self.provider.complete(request).await {
                Ok(response) => response,
                Err(e) => {
                    if e.is_overloaded() {
                        warn!(account_id = account.id, "Model {} overloaded", model);
                        self.fallback.record_overload();
                    }
                    return Err(e);
                }
            };
            if response.container_id.is_some() {
                container_id = response.container_id.clone();
            }

            self.download_files(&response.file_ids(), &scratch, &mut downloaded)
                .await;

            final_text = response.text();
            all_text.push_str(&final_text);

            let calls = response.tool_uses();
            if calls.is_empty() {
                debug!(turn_id = ctx.turn_id, "No tool calls in iteration {}", iteration);
                finished = true;
                break;
            }

            messages.push(Message {
                role: Role::Assistant,
                content: response.content,
            });

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                info!(turn_id = ctx.turn_id, tool = %call.name, "Dispatching tool call");
                let outcome = registry
                    .dispatch(call, Some(ctx.turn_id), ctx.message)
                    .await;
                if let Some(recipient) = &outcome.recipient {
                    outbox.record(recipient);
                }
                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: outcome.content,
                    is_error: outcome.is_error,
                });
            }
            messages.push(Message {
                role: Role::User,
                content: results,
            });
        }

        if !finished {
            warn!(
                turn_id = ctx.turn_id,
                "Stopped after {} iterations with tool calls still pending",
                self.settings.max_iterations
            );
            if final_text.trim().is_empty() {
                final_text = all_text;
            }
        }

        let mut payload = self.parser.parse(
            &final_text,
            &ParseContext {
                inbound_text: ctx.message.body(),
                account_language: account.language.as_deref(),
                default_language: &self.settings.default_language,
            },
        );
        for recipient in outbox.recipients() {
            payload.mark_sent_to(&recipient);
        }

        if payload.wants_document() {
            let document_model = self
                .settings
                .document_model
                .clone()
                .unwrap_or_else(|| model.clone());
            match self
                .documents
                .generate(&document_model, &payload, &scratch)
                .await
            {
                Ok(Some(attachment)) => payload.attachments.push(attachment),
                Ok(None) => payload.append_explanation(NOTE_NOT_CREATED),
                Err(e) => {
                    if e.is_overloaded() {
                        self.fallback.record_overload();
                    }
                    warn!(turn_id = ctx.turn_id, "Document generation failed: {}", e);
                    payload.append_explanation(NOTE_TECHNICAL_ERROR);
                }
            }
        }

        for path in &downloaded {
            let name = path.to_string_lossy().to_string();
            let filename = file_name_of(&name).to_string();
            match read_attachment(path, &filename, content_type_for(&name)).await {
                Ok(attachment) => payload.attachments.push(attachment),
                Err(e) => warn!("Skipping generated file {}: {}", name, e),
            }
        }

        let (attachments, dropped) =
            resolve_attachments(std::mem::take(&mut payload.attachments)).await;
        payload.attachments = attachments;
        if !dropped.is_empty() {
            payload.append_explanation(&format!(
                "\n\n[Note: Some attachments could not be attached: {}]",
                dropped.join(", ")
            ));
        }

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            debug!("Could not remove {}: {}", scratch.display(), e);
        }

        info!(
            turn_id = ctx.turn_id,
            "Loop finished with {} attachments",
            payload.attachments.len()
        );

        Ok(LoopOutcome {
            prompt: format!("{}\n\n{}", system, user),
            payload,
        })
    }

    async fn download_files(&self, file_ids: &[String], dir: &Path, out: &mut Vec<PathBuf>) {
        for file_id in file_ids {
            match self.provider.download_file(file_id, dir).await {
                Ok(path) => {
                    debug!("Downloaded {} to {}", file_id, path.display());
                    if !out.contains(&path) {
                        out.push(path);
                    }
                }
                Err(e) => warn!("Failed to download file {}: {}", file_id, e),
            }
        }
    }
}

/// Provider-executed capabilities every account gets.
pub fn account_capabilities(account: &Account) -> Vec<NativeCapability> {
    vec![
        NativeCapability::CodeExecution,
        NativeCapability::WebSearch {
            max_uses: WEB_SEARCH_MAX_USES,
            city: account.city.clone().filter(|c| !c.trim().is_empty()),
            country: country_code(account.country.as_deref()),
        },
        NativeCapability::Skills(DocumentSkill::ALL.to_vec()),
    ]
}
