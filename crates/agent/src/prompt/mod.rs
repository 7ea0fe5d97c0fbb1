//! System and user prompts for one turn.

use crate::tools::http::HttpToolSpec;
use crate::tools::mail::{FORWARD_EMAIL, SEND_EMAIL};
use postmate_core::types::{Account, InboundMessage};
use std::fmt::Write;

const AUTO_REPLY_EXPLANATION: &str = "Automatic reply detected - no action required";

const REPLY_FORMAT: &str = r#"```json
{
  "EmailResponseText": "Plain text reply",
  "EmailResponseSubject": "RE: original subject",
  "EmailResponseHtml": "<p>HTML reply</p>",
  "AiExplanation": "Short explanation of what you did",
  "attachments": [],
  "MustCreateAttachment": false,
  "AttachmentType": null,
  "AttachmentData": null,
  "AttachmentFilename": null
}
```"#;

pub struct PromptBuilder<'a> {
    pub account: &'a Account,
    pub default_language: &'a str,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(account: &'a Account, default_language: &'a str) -> Self {
        Self {
            account,
            default_language,
        }
    }

    fn language(&self) -> &str {
        self.account
            .language
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(self.default_language)
    }

    /// `mail_tools` says whether the built-in mail tools are registered.
    pub fn system(
        &self,
        message: &InboundMessage,
        mail_tools: bool,
        http_tools: &[&HttpToolSpec],
    ) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "You are an e-mail assistant for {} <{}>.",
            self.account.name, self.account.email_address
        );
        let _ = writeln!(
            out,
            "Write your replies in the language with code '{}' unless the sender clearly writes in another language.",
            self.language()
        );

        if !self.account.company_info.trim().is_empty() {
            let _ = write!(out, "\n## Company\n{}\n", self.account.company_info.trim());
        }
        if !self.account.task.trim().is_empty() {
            let _ = write!(out, "\n## Your task\n{}\n", self.account.task.trim());
        }

        let _ = write!(
            out,
            "\n## Current e-mail\nFrom: {}\nSubject: {}\nDate: {}\n",
            message.from,
            message.subject,
            message.received_at.format("%Y-%m-%d %H:%M UTC")
        );

        let _ = write!(
            out,
            "\n## Automatic replies\n\
             First decide whether the e-mail is an automatic message: out of office notices, \
             auto-replies, vacation notices, delivery reports, or mail carrying headers such as \
             Auto-Submitted or X-Autoreply. Never answer those. Return EmailResponseText, \
             EmailResponseSubject and EmailResponseHtml as null and set AiExplanation to \
             \"{}\".\n",
            AUTO_REPLY_EXPLANATION
        );

        let _ = write!(
            out,
            "\n## Response format\nEnd your answer with exactly one JSON object in this format:\n{}\n",
            REPLY_FORMAT
        );

        out.push_str(
            "\n## Rules\n\
             - You may reason briefly first. The JSON object must come last.\n\
             - If the e-mail was written in HTML, write the reply in HTML as well.\n\
             - Always fill both EmailResponseText and EmailResponseHtml.\n\
             - Quote the original message below your reply.\n\
             - Prefix the subject with \"RE:\".\n",
        );

        out.push_str(
            "\n## Documents\n\
             Do not create documents yourself. When the reply needs a document, set \
             MustCreateAttachment to true, AttachmentType to one of pdf, docx, xlsx or pptx, \
             put everything the document must contain into AttachmentData and a file name into \
             AttachmentFilename. Leave attachments empty; the document is attached for you.\n",
        );

        out.push_str("\n## Tools\n");
        if mail_tools {
            let _ = writeln!(
                out,
                "- {}: send an e-mail from {}.",
                SEND_EMAIL, self.account.email_address
            );
            let _ = writeln!(
                out,
                "- {}: forward the current e-mail to another address.",
                FORWARD_EMAIL
            );
        }
        for tool in http_tools {
            let _ = writeln!(
                out,
                "- {}: {} ({} {})",
                tool.name, tool.description, tool.method, tool.url_template
            );
        }
        if mail_tools {
            let _ = writeln!(
                out,
                "Use {} or {} to send mail. Never send mail with bash, curl or code execution.",
                SEND_EMAIL, FORWARD_EMAIL
            );
        } else {
            out.push_str(
                "You cannot send additional e-mails. Your reply is delivered for you. \
                 Never send mail with bash, curl or code execution.\n",
            );
        }

        out
    }

    /// Text body when there is one, the HTML body otherwise.
    pub fn user(&self, message: &InboundMessage) -> String {
        if message.text.trim().is_empty() {
            format!("Content (HTML):\n{}", message.html)
        } else {
            format!("Content (text):\n{}", message.text)
        }
    }
}
