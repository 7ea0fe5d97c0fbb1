use super::{
    CompletionProvider, CompletionRequest, CompletionResponse, ContentBlock, NativeCapability,
    Usage,
};
use async_trait::async_trait;
use postmate_core::error::{PostmateError, Result};
use postmate_core::types::file_name_of;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const API_VERSION: &str = "2023-06-01";
const CODE_EXECUTION_BETA: &str = "code-execution-2025-08-25";
const SKILLS_BETA: &str = "skills-2025-10-02";
const FILES_BETA: &str = "files-api-2025-04-14";
const HTTP_OVERLOADED: u16 = 529;

/// Anthropic Messages API client.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PostmateError::AI(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_body(request: &CompletionRequest) -> Value {
        let mut tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();

        let mut skills: Vec<Value> = Vec::new();
        for capability in &request.capabilities {
            match capability {
                NativeCapability::CodeExecution => tools.push(json!({
                    "type": "code_execution_20250825",
                    "name": "code_execution",
                })),
                NativeCapability::WebSearch {
                    max_uses,
                    city,
                    country,
                } => {
                    let mut location = json!({ "type": "approximate", "country": country });
                    if let Some(city) = city.as_deref().filter(|c| !c.trim().is_empty()) {
                        location["city"] = json!(city);
                    }
                    tools.push(json!({
                        "type": "web_search_20250305",
                        "name": "web_search",
                        "max_uses": max_uses,
                        "user_location": location,
                    }));
                }
                NativeCapability::Skills(list) => {
                    skills.extend(list.iter().map(|s| {
                        json!({ "type": "anthropic", "skill_id": s.to_string(), "version": "latest" })
                    }));
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": request.messages.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if !skills.is_empty() || request.container_id.is_some() {
            let mut container = json!({});
            if let Some(id) = &request.container_id {
                container["id"] = json!(id);
            }
            if !skills.is_empty() {
                container["skills"] = Value::Array(skills);
            }
            body["container"] = container;
        }
        body
    }

    fn betas(request: &CompletionRequest) -> Option<String> {
        let needs_container = request.capabilities.iter().any(|c| {
            matches!(
                c,
                NativeCapability::CodeExecution | NativeCapability::Skills(_)
            )
        });
        needs_container.then(|| [CODE_EXECUTION_BETA, SKILLS_BETA, FILES_BETA].join(","))
    }

    fn parse_response(body: Value) -> Result<CompletionResponse> {
        let content = body["content"]
            .as_array()
            .ok_or_else(|| PostmateError::AI("Missing 'content' array in Anthropic response".into()))?
            .iter()
            .cloned()
            .map(ContentBlock::from_json)
            .collect();

        Ok(CompletionResponse {
            content,
            stop_reason: body["stop_reason"].as_str().map(str::to_string),
            model: body["model"].as_str().unwrap_or_default().to_string(),
            container_id: body["container"]["id"].as_str().map(str::to_string),
            usage: Usage {
                input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            },
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }
}

/// Overload shows up as HTTP 529 or as an `overloaded_error` body.
pub fn is_overloaded(status: u16, body: &str) -> bool {
    status == HTTP_OVERLOADED || body.to_lowercase().contains("overloaded")
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::build_body(&request);

        let mut builder = self.authorized(self.client.post(&url)).json(&body);
        if let Some(betas) = Self::betas(&request) {
            builder = builder.header("anthropic-beta", betas);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PostmateError::Timeout(format!("Anthropic request timed out: {}", e))
            } else {
                PostmateError::AI(e.to_string())
            }
        })?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| PostmateError::AI(e.to_string()))?;

        if !status.is_success() {
            let snippet: String = raw.chars().take(600).collect();
            if is_overloaded(status.as_u16(), &raw) {
                warn!("Anthropic reported overload for model {}", request.model);
                return Err(PostmateError::Overloaded(format!(
                    "Anthropic HTTP {}: {}",
                    status.as_u16(),
                    snippet
                )));
            }
            return Err(PostmateError::AI(format!(
                "Anthropic HTTP {}: {}",
                status.as_u16(),
                snippet
            )));
        }

        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|e| PostmateError::AI(format!("Anthropic response decode failed: {}", e)))?;

        // Proxies sometimes wrap upstream errors in a 200.
        if let Some(error) = parsed.get("error") {
            let kind = error["type"].as_str().unwrap_or_default();
            if kind == "overloaded_error" {
                return Err(PostmateError::Overloaded(error.to_string()));
            }
            return Err(PostmateError::AI(format!("Anthropic API error: {}", error)));
        }

        let response = Self::parse_response(parsed)?;
        debug!(
            "Anthropic response: model={} stop={:?} in={} out={}",
            response.model,
            response.stop_reason,
            response.usage.input_tokens,
            response.usage.output_tokens
        );
        Ok(response)
    }

    async fn download_file(&self, file_id: &str, dir: &Path) -> Result<PathBuf> {
        let meta_url = format!("{}/v1/files/{}", self.base_url, file_id);
        let meta: Value = self
            .authorized(self.client.get(&meta_url))
            .header("anthropic-beta", FILES_BETA)
            .send()
            .await
            .map_err(|e| PostmateError::AI(e.to_string()))?
            .error_for_status()
            .map_err(|e| PostmateError::AI(e.to_string()))?
            .json()
            .await
            .map_err(|e| PostmateError::AI(e.to_string()))?;

        let filename = meta["filename"]
            .as_str()
            .map(file_name_of)
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .unwrap_or(file_id)
            .to_string();

        let content_url = format!("{}/v1/files/{}/content", self.base_url, file_id);
        let bytes = self
            .authorized(self.client.get(&content_url))
            .header("anthropic-beta", FILES_BETA)
            .send()
            .await
            .map_err(|e| PostmateError::AI(e.to_string()))?
            .error_for_status()
            .map_err(|e| PostmateError::AI(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| PostmateError::AI(e.to_string()))?;

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PostmateError::Internal(e.to_string()))?;
        let path = dir.join(filename);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| PostmateError::Internal(e.to_string()))?;

        debug!("Downloaded file {} to {}", file_id, path.display());
        Ok(path)
    }
}
