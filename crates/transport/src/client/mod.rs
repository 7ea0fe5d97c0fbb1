use crate::Mailer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postmate_core::error::{PostmateError, Result};
use postmate_core::types::{Account, InboundMessage, MessageSummary, OutgoingEmail, ReplyPayload};
use serde_json::{json, Value};
use tracing::{debug, info};

const LIST_LIMIT: u32 = 50;
const LIST_TIME_RANGE: &str = "1h";

/// Client for a bearer-authenticated mailbox REST API.
pub struct InboundApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl InboundApiClient {
    pub fn new(http: reqwest::Client, base_url: &str, token: &str) -> Self {
        let mut base_url = base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            http,
            base_url,
            token: token.to_string(),
        }
    }

    pub async fn list_unread(&self, account: &Account) -> Result<Vec<MessageSummary>> {
        let url = format!(
            "{}emails?limit={}&offset=0&type=received&status=unread&time_range={}&address={}",
            self.base_url,
            LIST_LIMIT,
            LIST_TIME_RANGE,
            urlencoding::encode(&account.email_address)
        );

        let body = self.get_json(&url).await?;
        let summaries: Vec<MessageSummary> = body["data"]
            .as_array()
            .map(|items| items.iter().filter_map(summary_from_json).collect())
            .unwrap_or_default();

        debug!(
            "Inbound API listed {} unread message(s) for {}",
            summaries.len(),
            account.email_address
        );
        Ok(summaries)
    }

    pub async fn fetch(&self, message_id: &str) -> Result<InboundMessage> {
        let url = format!("{}emails/{}", self.base_url, urlencoding::encode(message_id));
        let body = self.get_json(&url).await?;
        let email = if body["data"].is_object() {
            &body["data"]
        } else {
            &body
        };

        Ok(InboundMessage {
            id: id_string(&email["id"]).unwrap_or_default(),
            from: address_string(&email["from"]),
            to: address_list(&email["to"]),
            subject: email["subject"].as_str().unwrap_or_default().to_string(),
            text: email["text"].as_str().unwrap_or_default().to_string(),
            html: email["html"].as_str().unwrap_or_default().to_string(),
            received_at: parse_timestamp(&email["created_at"]).unwrap_or_else(Utc::now),
        })
    }

    pub async fn send_reply(
        &self,
        account: &Account,
        reply: &ReplyPayload,
        original: &InboundMessage,
        turn_id: i64,
    ) -> Result<()> {
        let url = format!("{}emails/{}/reply", self.base_url, urlencoding::encode(&original.id));

        // Only resolved content goes over the wire, never local paths.
        let attachments: Vec<Value> = reply
            .attachments
            .iter()
            .filter(|a| a.is_resolved())
            .map(|a| {
                json!({
                    "filename": a.filename,
                    "content": a.content,
                    "content_type": a.content_type,
                })
            })
            .collect();

        let payload = json!({
            "from": account.email_address,
            "subject": reply.subject,
            "text": reply.text,
            "html": reply.html,
            "attachments": attachments,
        });

        self.post_json(&url, &payload).await?;
        info!(
            "Reply for turn {} sent to {} via inbound API",
            turn_id, original.from
        );
        Ok(())
    }

    pub async fn mark_unread(&self, message_id: &str) -> Result<()> {
        let url = format!("{}emails/{}", self.base_url, urlencoding::encode(message_id));
        let response = self
            .http
            .patch(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "is_read": false }))
            .send()
            .await
            .map_err(|e| PostmateError::Transport(e.to_string()))?;

        ensure_success(response).await.map(|_| ())
    }

    pub fn mailer(&self, account: &Account) -> Result<InboundApiMailer> {
        if account.email_address.trim().is_empty() {
            return Err(PostmateError::Transport(format!(
                "Account {} has no sender address",
                account.id
            )));
        }
        Ok(InboundApiMailer {
            http: self.http.clone(),
            url: format!("{}emails", self.base_url),
            token: self.token.clone(),
            from: account.email_address.clone(),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| PostmateError::Transport(e.to_string()))?;

        let body = ensure_success(response).await?;
        serde_json::from_str(&body).map_err(|e| PostmateError::Transport(e.to_string()))
    }

    async fn post_json(&self, url: &str, payload: &Value) -> Result<String> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .map_err(|e| PostmateError::Transport(e.to_string()))?;

        ensure_success(response).await
    }
}

/// Sends new mail through the same API on behalf of one account.
pub struct InboundApiMailer {
    http: reqwest::Client,
    url: String,
    token: String,
    from: String,
}

#[async_trait]
impl Mailer for InboundApiMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<()> {
        let from = if email.from.trim().is_empty() {
            self.from.as_str()
        } else {
            email.from.as_str()
        };

        let mut payload = json!({
            "from": from,
            "to": email.to,
            "subject": email.subject,
            "text": email.text,
            "html": email.html,
        });
        if let Some(reply_to) = email.reply_to.as_deref().filter(|r| !r.trim().is_empty()) {
            payload["reply_to"] = json!(reply_to);
        }

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PostmateError::Transport(e.to_string()))?;

        ensure_success(response).await?;
        info!("Mail sent from {} to {}", from, email.to);
        Ok(())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| PostmateError::Transport(e.to_string()))?;

    if !status.is_success() {
        return Err(PostmateError::Transport(format!(
            "Inbound API returned {}: {}",
            status.as_u16(),
            body
        )));
    }
    Ok(body)
}

fn summary_from_json(item: &Value) -> Option<MessageSummary> {
    Some(MessageSummary {
        id: id_string(&item["id"])?,
        from: address_string(&item["from"]),
        subject: item["subject"].as_str().unwrap_or_default().to_string(),
        received_at: parse_timestamp(&item["created_at"]),
    })
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn address_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(_) => value["address"]
            .as_str()
            .or_else(|| value["email"].as_str())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn address_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(address_string)
            .filter(|a| !a.is_empty())
            .collect(),
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}
