pub mod anthropic;

use async_trait::async_trait;
use postmate_core::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub use anthropic::AnthropicProvider;

/// A chat completion service that can call tools.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Fails with `PostmateError::Overloaded` when the service reports overload.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Stores a file produced by code execution in `dir` and returns its path.
    async fn download_file(&self, file_id: &str, dir: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub capabilities: Vec<NativeCapability>,
    pub max_tokens: u32,
    /// Execution container to reuse between iterations of one turn.
    pub container_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub model: String,
    pub container_id: Option<String>,
    pub usage: Usage,
}

impl CompletionResponse {
    /// Text blocks, each followed by a newline.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text(text) = block {
                out.push_str(text);
                out.push('\n');
            }
        }
        out
    }

    pub fn tool_uses(&self) -> Vec<ToolUse> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Ids of files referenced anywhere in provider-specific blocks.
    pub fn file_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for block in &self.content {
            if let ContentBlock::Other(value) = block {
                collect_file_ids(value, &mut ids);
            }
        }
        ids
    }
}

fn collect_file_ids(value: &Value, ids: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match (key.as_str(), child) {
                    ("file_id", Value::String(id)) => {
                        if !ids.contains(id) {
                            ids.push(id.clone());
                        }
                    }
                    _ => collect_file_ids(child, ids),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_file_ids(item, ids);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text(text.into())],
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "role": self.role.to_string(),
            "content": self.content.iter().map(ContentBlock::to_json).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// Provider blocks (server tool calls and their results) echoed back verbatim.
    Other(Value),
}

impl ContentBlock {
    pub fn to_json(&self) -> Value {
        match self {
            ContentBlock::Text(text) => json!({ "type": "text", "text": text }),
            ContentBlock::ToolUse { id, name, input } => json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": [{ "type": "text", "text": content }],
                });
                if *is_error {
                    block["is_error"] = json!(true);
                }
                block
            }
            ContentBlock::Other(value) => value.clone(),
        }
    }

    pub fn from_json(value: Value) -> Self {
        match value["type"].as_str() {
            Some("text") => ContentBlock::Text(value["text"].as_str().unwrap_or_default().to_string()),
            Some("tool_use") => ContentBlock::ToolUse {
                id: value["id"].as_str().unwrap_or_default().to_string(),
                name: value["name"].as_str().unwrap_or_default().to_string(),
                input: value.get("input").cloned().unwrap_or_else(|| json!({})),
            },
            _ => ContentBlock::Other(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Client-side tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Capabilities executed by the provider itself.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCapability {
    CodeExecution,
    WebSearch {
        max_uses: u32,
        city: Option<String>,
        country: String,
    },
    Skills(Vec<DocumentSkill>),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum DocumentSkill {
    Pdf,
    Docx,
    Xlsx,
    Pptx,
}

impl DocumentSkill {
    pub const ALL: [DocumentSkill; 4] = [
        DocumentSkill::Pdf,
        DocumentSkill::Pptx,
        DocumentSkill::Xlsx,
        DocumentSkill::Docx,
    ];

    /// Maps a requested attachment type, including office aliases. Unknown
    /// types produce a PDF.
    pub fn from_attachment_type(kind: &str) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "docx" | "word" => DocumentSkill::Docx,
            "xlsx" | "excel" => DocumentSkill::Xlsx,
            "pptx" | "powerpoint" => DocumentSkill::Pptx,
            _ => DocumentSkill::Pdf,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            DocumentSkill::Pdf => "application/pdf",
            DocumentSkill::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            DocumentSkill::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            DocumentSkill::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
        }
    }
}
