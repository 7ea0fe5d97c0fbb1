use super::ToolOutcome;
use ai::provider::ToolSpec;
use postmate_core::error::{PostmateError, Result};
use postmate_core::text::text_to_html_document;
use postmate_core::types::{InboundMessage, OutgoingEmail};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use transport::Mailer;

pub const SEND_EMAIL: &str = "send_email";
pub const FORWARD_EMAIL: &str = "forward_email";

const FORWARD_SEPARATOR: &str = "---------- Forwarded message ----------";

pub fn send_email_spec(sender: &str) -> ToolSpec {
    ToolSpec {
        name: SEND_EMAIL.into(),
        description: format!(
            "Send an email to a recipient. Use this to forward emails or send new emails. \
             The sender address is always {}. When forwarding, use reply_to with the original \
             sender's email so replies go to them.",
            sender
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "description": "Recipient email address" },
                "subject": { "type": "string", "description": "Email subject" },
                "text": { "type": "string", "description": "Plain text content of the email" },
                "html": { "type": "string", "description": "HTML content of the email (optional)" },
                "reply_to": {
                    "type": "string",
                    "description": "Reply-to address (optional). When forwarding a customer email, set this to the customer's address so replies go directly to them."
                }
            },
            "required": ["to", "subject", "text"]
        }),
    }
}

pub fn forward_email_spec() -> ToolSpec {
    ToolSpec {
        name: FORWARD_EMAIL.into(),
        description: "Forward the email currently being processed to another address, \
                      optionally with a short note on top. Replies go to the original sender."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "description": "Recipient email address" },
                "message": { "type": "string", "description": "Note placed above the forwarded message (optional)" }
            },
            "required": ["to"]
        }),
    }
}

/// Built-in tools that send mail through the account's transport.
pub struct MailTools {
    mailer: Arc<dyn Mailer>,
}

impl MailTools {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    pub async fn send_email(&self, input: &Value) -> Result<ToolOutcome> {
        let to = required_str(input, "to")?;
        let subject = input["subject"].as_str().unwrap_or_default().to_string();
        let text = input["text"].as_str().unwrap_or_default().to_string();
        let html = match input["html"].as_str().filter(|h| !h.trim().is_empty()) {
            Some(html) => html.to_string(),
            None => text_to_html_document(&text),
        };
        let reply_to = input["reply_to"]
            .as_str()
            .filter(|r| !r.trim().is_empty())
            .map(str::to_string);

        self.mailer
            .send(OutgoingEmail {
                from: String::new(),
                to: to.clone(),
                subject,
                text,
                html,
                reply_to,
            })
            .await?;

        info!("send_email delivered to {}", to);
        Ok(ToolOutcome {
            content: format!("Email sent successfully to {}", to),
            is_error: false,
            recipient: Some(to),
        })
    }

    pub async fn forward_email(&self, input: &Value, original: &InboundMessage) -> Result<ToolOutcome> {
        let to = required_str(input, "to")?;
        let note = input["message"].as_str().unwrap_or_default();
        let text = forward_body(note, original);

        self.mailer
            .send(OutgoingEmail {
                from: String::new(),
                to: to.clone(),
                subject: forward_subject(&original.subject),
                html: text_to_html_document(&text),
                text,
                reply_to: Some(original.from.clone()).filter(|f| !f.is_empty()),
            })
            .await?;

        info!("forward_email delivered message {} to {}", original.id, to);
        Ok(ToolOutcome {
            content: format!("Email forwarded successfully to {}", to),
            is_error: false,
            recipient: Some(to),
        })
    }
}

fn required_str(input: &Value, key: &str) -> Result<String> {
    input[key]
        .as_str()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PostmateError::Tool(format!("'{}' is required", key)))
}

pub fn forward_subject(subject: &str) -> String {
    let lower = subject.trim_start().to_lowercase();
    if lower.starts_with("fwd:") || lower.starts_with("fw:") {
        subject.to_string()
    } else {
        format!("Fwd: {}", subject)
    }
}

pub fn forward_body(note: &str, original: &InboundMessage) -> String {
    let mut body = String::new();
    if !note.trim().is_empty() {
        body.push_str(note.trim());
        body.push_str("\n\n");
    }
    body.push_str(FORWARD_SEPARATOR);
    body.push_str(&format!("\nFrom: {}\nSubject: {}\n\n", original.from, original.subject));
    body.push_str(original.body());
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn original() -> InboundMessage {
        InboundMessage {
            id: "m-1".into(),
            from: "customer@example.org".into(),
            to: vec![],
            subject: "Broken router".into(),
            text: "It blinks red.".into(),
            html: String::new(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn forward_subject_is_prefixed_once() {
        assert_eq!(forward_subject("Hello"), "Fwd: Hello");
        assert_eq!(forward_subject("FW: Hello"), "FW: Hello");
        assert_eq!(forward_subject("fwd: Hello"), "fwd: Hello");
    }

    #[test]
    fn forward_body_layout() {
        let body = forward_body("Please handle", &original());
        assert_eq!(
            body,
            "Please handle\n\n---------- Forwarded message ----------\nFrom: customer@example.org\nSubject: Broken router\n\nIt blinks red."
        );
        assert!(forward_body("", &original()).starts_with(FORWARD_SEPARATOR));
    }

    #[test]
    fn send_email_schema_requires_core_fields() {
        let spec = send_email_spec("support@example.com");
        assert_eq!(spec.input_schema["required"], json!(["to", "subject", "text"]));
        assert!(spec.description.contains("support@example.com"));
    }
}
