use super::attachments::read_attachment;
use ai::provider::{
    CompletionProvider, CompletionRequest, DocumentSkill, Message, NativeCapability,
};
use postmate_core::error::Result;
use postmate_core::types::{file_name_of, Attachment, ReplyPayload};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const NOTE_NOT_CREATED: &str = "\n\n[Note: The requested document could not be created. However, the information is included in the email text.]";
pub const NOTE_TECHNICAL_ERROR: &str = "\n\n[Note: The requested document could not be created due to a technical error. However, the information is included in the email text.]";

/// Produces the document a reply asked for in a separate, tool-free request
/// scoped to a single document skill.
pub struct DocumentGenerator {
    provider: Arc<dyn CompletionProvider>,
    max_tokens: u32,
}

impl DocumentGenerator {
    pub fn new(provider: Arc<dyn CompletionProvider>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }

    /// `Ok(None)` when the model produced no downloadable file.
    pub async fn generate(
        &self,
        model: &str,
        payload: &ReplyPayload,
        scratch: &Path,
    ) -> Result<Option<Attachment>> {
        let kind = payload.attachment_type.as_deref().unwrap_or_default();
        let skill = DocumentSkill::from_attachment_type(kind);
        let label = skill.to_string().to_uppercase();
        let data = payload.attachment_data.as_deref().unwrap_or_default();

        info!("Generating {} document with {}", label, model);
        let response = self
            .provider
            .complete(CompletionRequest {
                model: model.to_string(),
                system: format!(
                    "You are a document generator. Create a single {} file from the data you \
                     are given. Save the finished file and do not answer with anything else.",
                    label
                ),
                messages: vec![Message::user_text(format!(
                    "Create a {} document with the following data:\n\n{}",
                    label, data
                ))],
                tools: Vec::new(),
                capabilities: vec![
                    NativeCapability::CodeExecution,
                    NativeCapability::Skills(vec![skill]),
                ],
                max_tokens: self.max_tokens,
                container_id: None,
            })
            .await?;

        for file_id in response.file_ids() {
            let path = match self.provider.download_file(&file_id, scratch).await {
                Ok(path) => path,
                Err(e) => {
                    warn!("Failed to download generated document {}: {}", file_id, e);
                    continue;
                }
            };

            let downloaded = path.to_string_lossy().to_string();
            let filename = payload
                .attachment_filename
                .as_deref()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| file_name_of(&downloaded))
                .to_string();

            let attachment = read_attachment(&path, &filename, skill.content_type()).await?;
            info!("Generated document {}", attachment.filename);
            return Ok(Some(attachment));
        }

        warn!("Document generation produced no file");
        Ok(None)
    }
}
