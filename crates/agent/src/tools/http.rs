//! Administrator-configured HTTP tools.
//!
//! Arguments arrive as one parameter string: either the `json` argument the
//! model filled in, or the whole argument object serialized. GET and DELETE
//! move top-level fields into the query string, POST and PUT send the body.

use super::ToolOutcome;
use ai::provider::ToolSpec;
use postmate_core::text::truncate_bytes;
use postmate_core::types::{HttpMethod, ToolDefinition};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use storage::sqlite::SqliteStorage;
use tracing::{debug, error, warn};

/// Typed descriptor derived from a [`ToolDefinition`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpToolSpec {
    pub tool_id: i64,
    pub name: String,
    pub description: String,
    pub method: HttpMethod,
    pub url_template: String,
    /// `{name}` tokens in the URL, in order of first appearance.
    pub placeholders: Vec<String>,
    pub bearer_token: Option<String>,
}

impl HttpToolSpec {
    /// `None` when the definition cannot be offered to a model.
    pub fn from_definition(def: &ToolDefinition, placeholder: &Regex) -> Option<Self> {
        let name = sanitize_tool_name(&def.name);
        let url = def.url_template.trim();
        if name.is_empty() || url.is_empty() {
            return None;
        }

        let mut placeholders: Vec<String> = Vec::new();
        for caps in placeholder.captures_iter(url) {
            let token = caps[1].to_string();
            if !placeholders.contains(&token) {
                placeholders.push(token);
            }
        }

        Some(Self {
            tool_id: def.id,
            name,
            description: def.description.clone(),
            method: def.method,
            url_template: url.to_string(),
            placeholders,
            bearer_token: def.bearer_token.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    /// One required string per placeholder, or a single `json` string.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let required: Vec<String> = if self.placeholders.is_empty() {
            properties.insert(
                "json".into(),
                json!({ "type": "string", "description": self.description }),
            );
            vec!["json".into()]
        } else {
            for token in &self.placeholders {
                properties.insert(
                    token.clone(),
                    json!({
                        "type": "string",
                        "description": format!("Value for {{{}}} in the URL", token),
                    }),
                );
            }
            self.placeholders.clone()
        };

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn tool_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: format!(
                "{} (HTTP {} {})",
                self.description, self.method, self.url_template
            ),
            input_schema: self.input_schema(),
        }
    }
}

/// Tool names must match `^[a-zA-Z0-9_-]{1,64}$`.
pub fn sanitize_tool_name(name: &str) -> String {
    name.replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(64)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub url: String,
    pub body: Option<String>,
}

/// Builds the final URL and body for one invocation.
pub fn prepare_call(tool: &HttpToolSpec, parameters: &str) -> PreparedCall {
    let trimmed = parameters.trim();
    let mut args: Option<Map<String, Value>> = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    };

    let mut url = tool.url_template.clone();
    if let Some(map) = args.as_mut() {
        for token in &tool.placeholders {
            if let Some(value) = map.remove(token) {
                url = url.replace(
                    &format!("{{{}}}", token),
                    &urlencoding::encode(&value_text(&value)),
                );
            }
        }
    }

    if tool.method.uses_query() {
        let query = match &args {
            Some(map) => map
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}={}",
                        urlencoding::encode(k),
                        urlencoding::encode(&value_text(v))
                    )
                })
                .collect::<Vec<_>>()
                .join("&"),
            None => trimmed.trim_start_matches('?').to_string(),
        };
        if !query.is_empty() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }
        return PreparedCall { url, body: None };
    }

    let body = match args {
        Some(map) if !tool.placeholders.is_empty() => Value::Object(map).to_string(),
        _ if trimmed.is_empty() => "{}".to_string(),
        _ => parameters.to_string(),
    };
    PreparedCall {
        url,
        body: Some(body),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Executes HTTP tools and keeps an audit record of every call.
pub struct HttpToolDispatcher {
    client: reqwest::Client,
    storage: Arc<SqliteStorage>,
    output_limit: usize,
}

impl HttpToolDispatcher {
    pub fn new(client: reqwest::Client, storage: Arc<SqliteStorage>, output_limit: usize) -> Self {
        Self {
            client,
            storage,
            output_limit,
        }
    }

    /// Never fails: transport and status errors become error outcomes.
    pub async fn execute(
        &self,
        tool: &HttpToolSpec,
        turn_id: Option<i64>,
        parameters: &str,
    ) -> ToolOutcome {
        let call = prepare_call(tool, parameters);
        debug!("Tool {} -> {} {}", tool.name, tool.method, call.url);

        let (result, is_error) = match self.send(tool, &call).await {
            Ok((status, body)) if status.is_success() => (body, false),
            Ok((status, body)) => (format!("ERROR ({}): {}", status.as_u16(), body), true),
            Err(e) => (format!("ERROR: {}", e), true),
        };

        if is_error {
            warn!("Tool {} failed: {}", tool.name, truncate_bytes(&result, 300));
        }

        if let Err(e) = self
            .storage
            .record_tool_invocation(tool.tool_id, turn_id, parameters, &result, is_error)
            .await
        {
            error!("Failed to record invocation of tool {}: {}", tool.name, e);
        }

        ToolOutcome {
            content: self.limit(result),
            is_error,
            recipient: None,
        }
    }

    async fn send(
        &self,
        tool: &HttpToolSpec,
        call: &PreparedCall,
    ) -> Result<(reqwest::StatusCode, String), reqwest::Error> {
        let method = match tool.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &call.url);
        if let Some(token) = &tool.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &call.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    fn limit(&self, result: String) -> String {
        if result.len() <= self.output_limit {
            return result;
        }
        format!(
            "{}...\n\n[Response truncated from {} to {} bytes]",
            truncate_bytes(&result, self.output_limit),
            result.len(),
            self.output_limit
        )
    }
}
