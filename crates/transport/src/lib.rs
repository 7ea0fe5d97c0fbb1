//! Mailbox transports.
//!
//! The engine only talks to [`Transport`]; each [`TransportKind`] maps to one
//! variant of [`MailTransport`], chosen once per account per poll cycle.

pub mod client;

use async_trait::async_trait;
use client::InboundApiClient;
use postmate_core::config::InboundConfig;
use postmate_core::error::{PostmateError, Result};
use postmate_core::types::{
    Account, InboundMessage, MessageSummary, OutgoingEmail, ReplyPayload, TransportKind,
};
use std::sync::Arc;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn list_unread(&self, account: &Account) -> Result<Vec<MessageSummary>>;

    async fn fetch(&self, account: &Account, summary: &MessageSummary) -> Result<InboundMessage>;

    async fn send_reply(
        &self,
        account: &Account,
        reply: &ReplyPayload,
        original: &InboundMessage,
        turn_id: i64,
    ) -> Result<()>;

    /// Puts a message back into the unread set after a failed turn.
    async fn mark_unread(&self, _account: &Account, _summary: &MessageSummary) -> Result<()> {
        Ok(())
    }

    /// Outbound mailer for the built-in mail tools.
    fn mailer(&self, account: &Account) -> Result<Arc<dyn Mailer>>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<()>;
}

pub enum MailTransport {
    InboundApi(InboundApiClient),
}

impl MailTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            MailTransport::InboundApi(_) => TransportKind::InboundApi,
        }
    }
}

#[async_trait]
impl Transport for MailTransport {
    async fn list_unread(&self, account: &Account) -> Result<Vec<MessageSummary>> {
        match self {
            MailTransport::InboundApi(client) => client.list_unread(account).await,
        }
    }

    async fn fetch(&self, _account: &Account, summary: &MessageSummary) -> Result<InboundMessage> {
        let mut message = match self {
            MailTransport::InboundApi(client) => client.fetch(&summary.id).await?,
        };
        if message.id.is_empty() {
            message.id = summary.id.clone();
        }
        Ok(message)
    }

    async fn send_reply(
        &self,
        account: &Account,
        reply: &ReplyPayload,
        original: &InboundMessage,
        turn_id: i64,
    ) -> Result<()> {
        match self {
            MailTransport::InboundApi(client) => {
                client.send_reply(account, reply, original, turn_id).await
            }
        }
    }

    async fn mark_unread(&self, _account: &Account, summary: &MessageSummary) -> Result<()> {
        match self {
            MailTransport::InboundApi(client) => client.mark_unread(&summary.id).await,
        }
    }

    fn mailer(&self, account: &Account) -> Result<Arc<dyn Mailer>> {
        match self {
            MailTransport::InboundApi(client) => Ok(Arc::new(client.mailer(account)?)),
        }
    }
}

/// Maps an account's transport kind to a live transport.
pub trait TransportResolver: Send + Sync {
    fn resolve(&self, kind: TransportKind) -> Result<Arc<dyn Transport>>;
}

/// Resolver backed by the configured transports.
pub struct TransportRegistry {
    inbound: Option<Arc<MailTransport>>,
}

impl TransportRegistry {
    pub fn from_config(config: &InboundConfig, http: reqwest::Client) -> Self {
        let inbound = match (&config.base_url, &config.token) {
            (Some(base_url), Some(token)) if !base_url.trim().is_empty() => Some(Arc::new(
                MailTransport::InboundApi(InboundApiClient::new(http, base_url, token)),
            )),
            _ => None,
        };
        Self { inbound }
    }
}

impl TransportResolver for TransportRegistry {
    fn resolve(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        match kind {
            TransportKind::InboundApi => self
                .inbound
                .clone()
                .map(|t| t as Arc<dyn Transport>)
                .ok_or_else(|| {
                    PostmateError::Config("inbound_api transport is not configured".into())
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_without_token_cannot_resolve() {
        let registry = TransportRegistry::from_config(
            &InboundConfig {
                base_url: Some("https://mail.example.com/api/".into()),
                token: None,
            },
            reqwest::Client::new(),
        );
        assert!(registry.resolve(TransportKind::InboundApi).is_err());
    }

    #[test]
    fn registry_resolves_configured_transport() {
        let registry = TransportRegistry::from_config(
            &InboundConfig {
                base_url: Some("https://mail.example.com/api/".into()),
                token: Some("secret".into()),
            },
            reqwest::Client::new(),
        );
        assert!(registry.resolve(TransportKind::InboundApi).is_ok());
    }
}
