//! TOML settings for the daemon.
//!
//! Every section has defaults so a minimal file only needs credentials and the
//! accounts to seed. Secrets may come from the environment instead of the file.

use crate::error::{PostmateError, Result};
use crate::types::{AccountState, HttpMethod, ProviderKind, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

pub const ANTHROPIC_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const INBOUND_TOKEN_ENV: &str = "POSTMATE_INBOUND_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Settings {
    #[serde(default)]
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[serde(default)]
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub anthropic: AnthropicConfig,
    #[serde(default)]
    pub inbound: InboundConfig,
    #[serde(default)]
    #[validate(nested)]
    pub agent: AgentConfig,
    #[serde(default)]
    #[validate(nested)]
    pub accounts: Vec<AccountSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchedulerConfig {
    #[validate(range(min = 1))]
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Overrides `interval_secs` when set.
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_lease_cooldown_secs")]
    pub lease_cooldown_secs: u64,
    #[validate(range(min = 1))]
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    #[serde(default = "default_send_backoff_secs")]
    pub send_backoff_secs: Vec<u64>,
    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_max_concurrent_accounts")]
    pub max_concurrent_accounts: usize,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lease_cooldown(&self) -> Duration {
        Duration::from_secs(self.lease_cooldown_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn send_backoff(&self) -> Vec<Duration> {
        self.send_backoff_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            cron: None,
            lease_cooldown_secs: default_lease_cooldown_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
            send_backoff_secs: default_send_backoff_secs(),
            max_concurrent_accounts: default_max_concurrent_accounts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AnthropicConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[validate(url)]
    #[serde(default = "default_anthropic_url")]
    pub base_url: String,
    #[validate(range(min = 1))]
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Substring (case-insensitive) that marks a model as premium tier.
    #[validate(length(min = 1))]
    #[serde(default = "default_premium_marker")]
    pub premium_marker: String,
    #[validate(length(min = 1))]
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    /// Model for document generation; the account's resolved model when unset.
    #[serde(default)]
    pub document_model: Option<String>,
}

impl AnthropicConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_anthropic_url(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            premium_marker: default_premium_marker(),
            fallback_model: default_fallback_model(),
            document_model: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Base URL of the mailbox REST API, with trailing slash.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AgentConfig {
    #[validate(length(min = 2, max = 5))]
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[validate(range(min = 1024))]
    #[serde(default = "default_tool_output_limit")]
    pub tool_output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_language: default_language(),
            scratch_dir: default_scratch_dir(),
            max_iterations: default_max_iterations(),
            tool_output_limit_bytes: default_tool_output_limit(),
        }
    }
}

/// Account declared in the settings file and upserted into the store at start.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AccountSeed {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(email)]
    pub email_address: String,
    #[validate(length(min = 1))]
    pub model: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub company_info: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub state: AccountState,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    #[validate(nested)]
    pub tools: Vec<ToolSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ToolSeed {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[validate(length(min = 1))]
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PostmateError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut settings = Self::from_toml_str(&content)?;
        settings.apply_env_overrides();
        settings.check()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PostmateError::Config(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(ANTHROPIC_KEY_ENV) {
            if !key.trim().is_empty() {
                self.anthropic.api_key = Some(key);
            }
        }
        if let Ok(token) = std::env::var(INBOUND_TOKEN_ENV) {
            if !token.trim().is_empty() {
                self.inbound.token = Some(token);
            }
        }
    }

    /// Field validation plus the cross-section rules derive cannot express.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| PostmateError::Validation(e.to_string()))?;

        let uses_inbound = self
            .accounts
            .iter()
            .any(|a| a.transport == TransportKind::InboundApi && a.state == AccountState::Active);
        if uses_inbound && self.inbound.base_url.as_deref().map_or(true, str::is_empty) {
            return Err(PostmateError::Config(
                "inbound.base_url is required by accounts using the inbound_api transport".into(),
            ));
        }
        Ok(())
    }
}

fn default_database_path() -> String {
    "postmate.db".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_lease_cooldown_secs() -> u64 {
    60
}

fn default_turn_timeout_secs() -> u64 {
    600
}

fn default_send_backoff_secs() -> Vec<u64> {
    vec![5, 15, 30]
}

fn default_max_concurrent_accounts() -> usize {
    1
}

fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_max_tokens() -> u32 {
    8000
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_premium_marker() -> String {
    "opus".to_string()
}

fn default_fallback_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_language() -> String {
    "de".to_string()
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("skill-output")
}

fn default_max_iterations() -> usize {
    20
}

fn default_tool_output_limit() -> usize {
    50 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.scheduler.lease_cooldown_secs, 60);
        assert_eq!(settings.scheduler.send_backoff_secs, vec![5, 15, 30]);
        assert_eq!(settings.agent.max_iterations, 20);
        assert_eq!(settings.anthropic.max_tokens, 8000);
        assert_eq!(settings.anthropic.premium_marker, "opus");
        assert!(settings.check().is_ok());
    }

    #[test]
    fn parses_accounts_with_tools() {
        let settings = Settings::from_toml_str(
            r#"
            [inbound]
            base_url = "https://mail.example.com/api/"

            [[accounts]]
            name = "Support"
            email_address = "support@example.com"
            model = "claude-opus-4-1"
            language = "en"

            [[accounts.tools]]
            name = "Order Status"
            description = "Look up an order"
            method = "GET"
            url = "https://shop.example.com/orders/{orderId}"
            "#,
        )
        .unwrap();

        assert!(settings.check().is_ok());
        let account = &settings.accounts[0];
        assert_eq!(account.transport, TransportKind::InboundApi);
        assert_eq!(account.tools[0].method, HttpMethod::Get);
    }

    #[test]
    fn inbound_accounts_require_base_url() {
        let settings = Settings::from_toml_str(
            r#"
            [[accounts]]
            name = "Support"
            email_address = "support@example.com"
            model = "claude-sonnet-4-5"
            "#,
        )
        .unwrap();

        assert!(matches!(settings.check(), Err(PostmateError::Config(_))));
    }

    #[test]
    fn rejects_invalid_email() {
        let settings = Settings::from_toml_str(
            r#"
            [inbound]
            base_url = "https://mail.example.com/api/"

            [[accounts]]
            name = "Support"
            email_address = "not-an-address"
            model = "claude-sonnet-4-5"
            "#,
        )
        .unwrap();

        assert!(matches!(settings.check(), Err(PostmateError::Validation(_))));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postmate.toml");
        std::fs::write(&path, "[database]\npath = \"/var/lib/postmate.db\"\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.database.path, "/var/lib/postmate.db");
    }
}
