use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use postmate_core::error::{PostmateError, Result};
use postmate_core::types::{file_name_of, Attachment};
use std::path::Path;
use tracing::{debug, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type derived from a file extension.
pub fn content_type_for(path: &str) -> &'static str {
    let extension = match file_name_of(path).rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => return DEFAULT_CONTENT_TYPE,
    };
    match extension.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "xml" => "text/xml",
        "json" => "application/json",
        "zip" => "application/zip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Reads a file into a base64 attachment.
pub async fn read_attachment(path: &Path, filename: &str, content_type: &str) -> Result<Attachment> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PostmateError::Internal(format!("{}: {}", path.display(), e)))?;
    debug!("Read attachment {} ({} bytes)", path.display(), bytes.len());
    Ok(Attachment {
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        content: Some(STANDARD.encode(bytes)),
        path: None,
    })
}

/// Fills in content for path-only attachments. Entries with neither valid
/// base64 content nor a readable path are dropped; their names are returned
/// alongside the kept ones.
pub async fn resolve_attachments(attachments: Vec<Attachment>) -> (Vec<Attachment>, Vec<String>) {
    let mut resolved = Vec::with_capacity(attachments.len());
    let mut dropped = Vec::new();
    for attachment in attachments {
        if attachment.is_resolved() {
            match attachment.content.as_deref().map(|c| STANDARD.decode(c)) {
                Some(Err(e)) => {
                    warn!("Dropping attachment '{}' with invalid content: {}", attachment.filename, e);
                    dropped.push(display_name(&attachment));
                }
                _ => resolved.push(attachment),
            }
            continue;
        }

        let path = match attachment.path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => path.to_string(),
            None => {
                warn!("Dropping attachment '{}' without content or path", attachment.filename);
                dropped.push(display_name(&attachment));
                continue;
            }
        };

        let filename = if attachment.filename.trim().is_empty() {
            file_name_of(&path).to_string()
        } else {
            attachment.filename.clone()
        };
        let content_type = if attachment.content_type.trim().is_empty() {
            content_type_for(&path).to_string()
        } else {
            attachment.content_type.clone()
        };

        match read_attachment(Path::new(&path), &filename, &content_type).await {
            Ok(read) => resolved.push(read),
            Err(e) => {
                warn!("Dropping unreadable attachment {}: {}", path, e);
                dropped.push(filename);
            }
        }
    }
    (resolved, dropped)
}

fn display_name(attachment: &Attachment) -> String {
    if attachment.filename.trim().is_empty() {
        "unnamed".to_string()
    } else {
        attachment.filename.clone()
    }
}
