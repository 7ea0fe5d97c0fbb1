use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub email_address: String,
    pub state: AccountState,
    pub transport: TransportKind,
    pub provider: ProviderKind,
    pub model: String,
    pub language: Option<String>,
    pub task: String,
    pub company_info: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccountState {
    #[default]
    Active,
    Disabled,
}

/// The mailbox backend an account is served by. Closed set; each kind maps to
/// exactly one transport implementation.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    #[default]
    InboundApi,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Anthropic,
}

/// Listing entry returned by a transport before the full message is fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageSummary {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Body the model sees: plain text when present, otherwise the HTML part.
    pub fn body(&self) -> &str {
        if self.text.trim().is_empty() {
            &self.html
        } else {
            &self.text
        }
    }
}

/// Durable record of one processed inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: i64,
    pub account_id: i64,
    pub message_id: String,
    pub email_from: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub prompt: String,
    pub reply_text: Option<String>,
    pub reply_html: Option<String>,
    pub reply_subject: Option<String>,
    pub explanation: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Turn {
    pub fn from_message(account_id: i64, message: &InboundMessage) -> Self {
        Self {
            id: 0,
            account_id,
            message_id: message.id.clone(),
            email_from: message.from.clone(),
            subject: message.subject.clone(),
            text: message.text.clone(),
            html: message.html.clone(),
            prompt: String::new(),
            reply_text: None,
            reply_html: None,
            reply_subject: None,
            explanation: None,
            received_at: message.received_at,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// GET and DELETE carry their arguments in the query string.
    pub fn uses_query(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }
}

/// Administrator-configured HTTP tool. The parameter schema is derived from
/// `url_template` at registration time and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub description: String,
    pub method: HttpMethod,
    pub url_template: String,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub id: i64,
    pub tool_id: i64,
    pub turn_id: Option<i64>,
    pub parameters: String,
    pub result: String,
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub filename: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content_type: String,
    /// Base64 encoded body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Attachment {
    pub fn from_path(path: &str) -> Self {
        Self {
            filename: file_name_of(path).to_string(),
            path: Some(path.to_string()),
            ..Default::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// Structured reply extracted from the model's final answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplyPayload {
    #[serde(rename = "EmailResponseText", default, deserialize_with = "null_as_empty")]
    pub text: String,
    #[serde(rename = "EmailResponseSubject", default, deserialize_with = "null_as_empty")]
    pub subject: String,
    #[serde(rename = "EmailResponseHtml", default, deserialize_with = "null_as_empty")]
    pub html: String,
    #[serde(rename = "AiExplanation", default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, deserialize_with = "attachment_list")]
    pub attachments: Vec<Attachment>,
    #[serde(rename = "MustCreateAttachment", default, deserialize_with = "null_as_false")]
    pub must_create_attachment: bool,
    #[serde(rename = "AttachmentType", default, skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
    #[serde(rename = "AttachmentData", default, skip_serializing_if = "Option::is_none")]
    pub attachment_data: Option<String>,
    #[serde(rename = "AttachmentFilename", default, skip_serializing_if = "Option::is_none")]
    pub attachment_filename: Option<String>,
    /// Lower-cased recipients already addressed by a mail tool during the turn.
    #[serde(skip)]
    pub already_sent_to: HashSet<String>,
}

impl ReplyPayload {
    /// Neither a text nor an HTML body: nothing is transmitted.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.html.trim().is_empty()
    }

    pub fn mark_sent_to(&mut self, address: &str) {
        self.already_sent_to.insert(address.trim().to_lowercase());
    }

    pub fn was_sent_to(&self, address: &str) -> bool {
        self.already_sent_to.contains(&address.trim().to_lowercase())
    }

    pub fn wants_document(&self) -> bool {
        self.must_create_attachment
            && self.attachment_type.as_deref().is_some_and(|t| !t.trim().is_empty())
            && self.attachment_data.as_deref().is_some_and(|d| !d.trim().is_empty())
    }

    pub fn append_explanation(&mut self, note: &str) {
        let mut explanation = self.explanation.take().unwrap_or_default();
        explanation.push_str(note);
        self.explanation = Some(explanation);
    }
}

/// Outbound mail composed by a built-in tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMail {
    pub id: i64,
    pub turn_id: i64,
    pub receiver: String,
    pub subject: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

pub fn file_name_of(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_false<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

// Models send either attachment objects or bare path strings.
fn attachment_list<'de, D>(deserializer: D) -> std::result::Result<Vec<Attachment>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_json::Value::deserialize(deserializer)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        _ => return Ok(Vec::new()),
    };

    let mut attachments = Vec::with_capacity(items.len());
    for item in items {
        match item {
            serde_json::Value::String(path) if !path.trim().is_empty() => {
                attachments.push(Attachment::from_path(path.trim()));
            }
            serde_json::Value::Object(_) => {
                attachments.push(serde_json::from_value(item).map_err(D::Error::custom)?);
            }
            _ => {}
        }
    }
    Ok(attachments)
}
