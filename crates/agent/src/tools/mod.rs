pub mod http;
pub mod mail;

use ai::provider::{ToolSpec, ToolUse};
use http::{HttpToolDispatcher, HttpToolSpec};
use mail::MailTools;
use postmate_core::error::{PostmateError, Result};
use postmate_core::types::{Account, InboundMessage, ToolDefinition};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use transport::Transport;

/// Matches `{name}` tokens in tool URL templates.
pub const PLACEHOLDER_PATTERN: &str = r"\{(\w+)\}";

/// Result of one tool invocation, fed back to the model as a tool result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
    /// Address a built-in mail tool delivered to.
    pub recipient: Option<String>,
}

impl ToolOutcome {
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            content: format!("ERROR: {}", message),
            is_error: true,
            recipient: None,
        }
    }
}

enum Handler {
    SendEmail,
    ForwardEmail,
    Http(HttpToolSpec),
}

/// Tools offered to the model for one account during one turn.
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    handlers: HashMap<String, Handler>,
    mail: Option<MailTools>,
    dispatcher: Arc<HttpToolDispatcher>,
}

impl ToolRegistry {
    pub fn build(
        account: &Account,
        definitions: &[ToolDefinition],
        transport: &dyn Transport,
        dispatcher: Arc<HttpToolDispatcher>,
    ) -> Result<Self> {
        let placeholder =
            Regex::new(PLACEHOLDER_PATTERN).map_err(|e| PostmateError::Internal(e.to_string()))?;

        let mut registry = Self {
            specs: Vec::new(),
            handlers: HashMap::new(),
            mail: None,
            dispatcher,
        };

        match transport.mailer(account) {
            Ok(mailer) => {
                registry.mail = Some(MailTools::new(mailer));
                registry.insert(mail::send_email_spec(&account.email_address), Handler::SendEmail);
                registry.insert(mail::forward_email_spec(), Handler::ForwardEmail);
            }
            Err(e) => warn!(
                "Mail tools unavailable for account {}: {}",
                account.email_address, e
            ),
        }

        for def in definitions {
            match HttpToolSpec::from_definition(def, &placeholder) {
                Some(tool) => {
                    info!(
                        "Registered tool {} ({} {}) for account {}",
                        tool.name, tool.method, tool.url_template, account.email_address
                    );
                    registry.insert(tool.tool_spec(), Handler::Http(tool));
                }
                None => warn!(
                    "Skipping malformed tool definition {} ('{}') for account {}",
                    def.id, def.name, account.email_address
                ),
            }
        }

        Ok(registry)
    }

    fn insert(&mut self, spec: ToolSpec, handler: Handler) {
        // Both schemas stay listed; only the handler is replaced.
        if self.handlers.contains_key(&spec.name) {
            warn!("Tool name {} is defined twice, the later handler wins", spec.name);
        }
        self.handlers.insert(spec.name.clone(), handler);
        self.specs.push(spec);
    }

    /// Whether send_email and forward_email are offered.
    pub fn has_mail_tools(&self) -> bool {
        self.mail.is_some()
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// Distinct tool names, in registration order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for spec in &self.specs {
            if !names.contains(&spec.name) {
                names.push(spec.name.clone());
            }
        }
        names
    }

    /// Administrator-configured tools that will actually handle calls.
    pub fn http_tools(&self) -> Vec<&HttpToolSpec> {
        self.names()
            .iter()
            .filter_map(|name| match self.handlers.get(name) {
                Some(Handler::Http(tool)) => Some(tool),
                _ => None,
            })
            .collect()
    }

    /// Runs one tool call. Failures become error outcomes for the model.
    pub async fn dispatch(
        &self,
        call: &ToolUse,
        turn_id: Option<i64>,
        original: &InboundMessage,
    ) -> ToolOutcome {
        let handler = match self.handlers.get(&call.name) {
            Some(handler) => handler,
            None => {
                warn!("Model requested unknown tool {}", call.name);
                return ToolOutcome {
                    content: format!(
                        "ERROR: Tool '{}' is not available for direct use. Please use the available tools instead: {}",
                        call.name,
                        self.names().join(", ")
                    ),
                    is_error: true,
                    recipient: None,
                };
            }
        };

        let result = match (handler, &self.mail) {
            (Handler::SendEmail, Some(mail)) => mail.send_email(&call.input).await,
            (Handler::ForwardEmail, Some(mail)) => mail.forward_email(&call.input, original).await,
            (Handler::Http(tool), _) => {
                return self
                    .dispatcher
                    .execute(tool, turn_id, &http_parameters(&call.input))
                    .await
            }
            _ => Err(PostmateError::Tool(format!("{} has no mailer", call.name))),
        };

        result.unwrap_or_else(|e| {
            warn!("Tool {} failed: {}", call.name, e);
            ToolOutcome::error(e)
        })
    }
}

/// The `json` argument when the model supplied one, else the whole input.
pub fn http_parameters(input: &serde_json::Value) -> String {
    match input.get("json") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_argument_is_unwrapped() {
        assert_eq!(http_parameters(&json!({"json": "{\"a\":1}"})), "{\"a\":1}");
        assert_eq!(http_parameters(&json!({"json": {"a": 1}})), "{\"a\":1}");
        assert_eq!(http_parameters(&json!({"orderId": "7"})), "{\"orderId\":\"7\"}");
    }

    #[test]
    fn error_outcome_prefix() {
        let outcome = ToolOutcome::error("boom");
        assert_eq!(outcome.content, "ERROR: boom");
        assert!(outcome.is_error);
    }
}
