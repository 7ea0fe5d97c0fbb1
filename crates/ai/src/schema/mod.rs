use crate::language::{detect_language, fallback_message};
use jsonschema::JSONSchema;
use postmate_core::error::{PostmateError, Result};
use postmate_core::text::paragraph;
use postmate_core::types::ReplyPayload;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

const FENCE_OPEN: &str = "```json";

/// Shape check for reply objects, run before deserializing a candidate.
pub struct ReplyValidator {
    schema: JSONSchema,
}

impl ReplyValidator {
    pub fn new() -> Result<Self> {
        let nullable_string = serde_json::json!({ "type": ["string", "null"] });
        let schema_json = serde_json::json!({
            "type": "object",
            "properties": {
                "EmailResponseText": nullable_string,
                "EmailResponseSubject": nullable_string,
                "EmailResponseHtml": nullable_string,
                "AiExplanation": nullable_string,
                "attachments": {
                    "type": ["array", "null"],
                    "items": { "type": ["string", "object"] }
                },
                "MustCreateAttachment": { "type": ["boolean", "null"] },
                "AttachmentType": nullable_string,
                "AttachmentData": nullable_string,
                "AttachmentFilename": nullable_string
            }
        });

        let schema = JSONSchema::compile(&schema_json)
            .map_err(|e| PostmateError::Internal(format!("Invalid reply schema: {}", e)))?;
        Ok(Self { schema })
    }

    pub fn validate(&self, json: &Value) -> bool {
        self.schema.is_valid(json)
    }
}

/// What the parser needs to pick a language for fallback replies.
pub struct ParseContext<'a> {
    pub inbound_text: &'a str,
    pub account_language: Option<&'a str>,
    pub default_language: &'a str,
}

impl ParseContext<'_> {
    fn language(&self) -> &str {
        detect_language(self.inbound_text)
            .or(self.account_language.filter(|l| !l.trim().is_empty()))
            .unwrap_or(self.default_language)
    }
}

/// Extracts a [`ReplyPayload`] from free-form model output. Never fails: the
/// worst case is a degraded payload carrying the raw text.
pub struct ResponseParser {
    validator: ReplyValidator,
    fenced: Regex,
}

impl ResponseParser {
    pub fn new() -> Result<Self> {
        let fenced = Regex::new(r"```json\s*([\s\S]*?)\s*```")
            .map_err(|e| PostmateError::Internal(e.to_string()))?;
        Ok(Self {
            validator: ReplyValidator::new()?,
            fenced,
        })
    }

    pub fn parse(&self, raw: &str, ctx: &ParseContext<'_>) -> ReplyPayload {
        if raw.trim().is_empty() {
            warn!("Empty model response, using fallback reply");
            return Self::fallback_payload(ctx);
        }

        if let Some(payload) = self.parse_fenced(raw) {
            debug!("Reply parsed from fenced JSON block");
            return payload;
        }

        if let Some(payload) = self.parse_trailing_object(raw) {
            debug!("Reply parsed from trailing JSON object");
            return payload;
        }

        let trimmed = raw.trim();
        match self.candidate(trimmed) {
            Ok(payload) => payload,
            Err(reason) => {
                let preview: String = trimmed.chars().take(500).collect();
                warn!("Failed to parse model response: {} | {}", reason, preview);
                ReplyPayload {
                    text: trimmed.to_string(),
                    html: paragraph(trimmed),
                    subject: fallback_message(ctx.language()).subject.to_string(),
                    explanation: Some(format!("Parse error: {}", reason)),
                    ..Default::default()
                }
            }
        }
    }

    fn parse_fenced(&self, raw: &str) -> Option<ReplyPayload> {
        let captures = self.fenced.captures(raw)?;
        let body = captures.get(1)?.as_str();

        match self.candidate(body) {
            Ok(mut payload) => {
                let start = raw.find(FENCE_OPEN).unwrap_or(0);
                set_prose(&mut payload, &raw[..start]);
                Some(payload)
            }
            Err(reason) => {
                debug!("Fenced JSON block rejected: {}", reason);
                None
            }
        }
    }

    /// Walks back from the last `}` and tries every balanced `{...}` that
    /// ends there, innermost first.
    fn parse_trailing_object(&self, raw: &str) -> Option<ReplyPayload> {
        let last = raw.rfind('}')?;
        let bytes = raw.as_bytes();
        let mut depth: i32 = 0;

        for i in (0..=last).rev() {
            match bytes[i] {
                b'}' => depth += 1,
                b'{' => depth -= 1,
                _ => continue,
            }
            if depth != 0 {
                continue;
            }
            if let Ok(mut payload) = self.candidate(&raw[i..=last]) {
                if !payload.text.is_empty() {
                    set_prose(&mut payload, &raw[..i]);
                    return Some(payload);
                }
            }
        }
        None
    }

    fn candidate(&self, text: &str) -> std::result::Result<ReplyPayload, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        if !self.validator.validate(&value) {
            return Err("reply object does not match the expected shape".to_string());
        }
        serde_json::from_value(value).map_err(|e| e.to_string())
    }

    fn fallback_payload(ctx: &ParseContext<'_>) -> ReplyPayload {
        let message = fallback_message(ctx.language());
        ReplyPayload {
            text: message.text.to_string(),
            subject: message.subject.to_string(),
            html: paragraph(message.text),
            ..Default::default()
        }
    }
}

fn set_prose(payload: &mut ReplyPayload, before: &str) {
    let prose = before.trim();
    if !prose.is_empty() {
        payload.explanation = Some(prose.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postmate_core::types::Attachment;

    fn ctx<'a>(inbound: &'a str, account: Option<&'a str>) -> ParseContext<'a> {
        ParseContext {
            inbound_text: inbound,
            account_language: account,
            default_language: "de",
        }
    }

    fn parser() -> ResponseParser {
        ResponseParser::new().unwrap()
    }

    #[test]
    fn empty_response_uses_detected_language() {
        let payload = parser().parse(
            "  \n",
            &ctx("Hello, could you please send the invoice? Thanks", Some("de")),
        );
        assert_eq!(payload.subject, "RE: Your inquiry");
        assert_eq!(
            payload.html,
            "<p>I was unable to generate a suitable response. Please try again.</p>"
        );
    }

    #[test]
    fn empty_response_falls_back_to_account_then_default_language() {
        let payload = parser().parse("", &ctx("", Some("fr")));
        assert_eq!(payload.subject, "RE: Votre demande");

        let payload = parser().parse("", &ctx("", None));
        assert_eq!(payload.subject, "RE: Ihre Anfrage");
    }

    #[test]
    fn fenced_block_with_prose() {
        let raw = "I checked the order system.\n```json\n{\"EmailResponseText\": \"Shipped\", \"EmailResponseSubject\": \"RE: Order\", \"EmailResponseHtml\": \"<p>Shipped</p>\"}\n```\n";
        let payload = parser().parse(raw, &ctx("", None));
        assert_eq!(payload.text, "Shipped");
        assert_eq!(payload.subject, "RE: Order");
        assert_eq!(payload.explanation.as_deref(), Some("I checked the order system."));
    }

    #[test]
    fn malformed_fenced_block_falls_through_to_brace_scan() {
        let raw = "```json\n{\"EmailResponseText\": \"broken\",,}\n```\nSecond try: {\"EmailResponseText\": \"ok\"}";
        let payload = parser().parse(raw, &ctx("", None));
        assert_eq!(payload.text, "ok");
    }

    #[test]
    fn trailing_object_after_prose() {
        let raw = "Thinking... {not json} more text\n{\"EmailResponseText\": \"Hi\", \"attachments\": [\"/tmp/a.pdf\"], \"meta\": {\"x\": 1}}";
        let payload = parser().parse(raw, &ctx("", None));
        assert_eq!(payload.text, "Hi");
        assert_eq!(payload.attachments[0].filename, "a.pdf");
        assert_eq!(
            payload.explanation.as_deref(),
            Some("Thinking... {not json} more text")
        );
    }

    #[test]
    fn trailing_object_requires_text() {
        let raw = "prefix {\"EmailResponseSubject\": \"only subject\"}";
        let payload = parser().parse(raw, &ctx("", Some("en")));
        // Falls through to the whole-text attempt, which is not JSON.
        assert_eq!(payload.text, raw);
        assert_eq!(payload.subject, "RE: Your inquiry");
        assert!(payload.explanation.unwrap().starts_with("Parse error:"));
    }

    #[test]
    fn whole_text_json_is_accepted() {
        let raw = "  {\"EmailResponseText\": null, \"EmailResponseSubject\": \"S\", \"MustCreateAttachment\": true, \"AttachmentType\": \"pdf\", \"AttachmentData\": \"rows\"}  ";
        let payload = parser().parse(raw, &ctx("", None));
        assert_eq!(payload.text, "");
        assert_eq!(payload.subject, "S");
        assert!(payload.wants_document());
    }

    #[test]
    fn plain_prose_degrades_with_escaped_html() {
        let payload = parser().parse("Sorry <b>no</b> JSON here", &ctx("", Some("en")));
        assert_eq!(payload.text, "Sorry <b>no</b> JSON here");
        assert_eq!(payload.html, "<p>Sorry &lt;b&gt;no&lt;/b&gt; JSON here</p>");
        assert_eq!(payload.subject, "RE: Your inquiry");
    }

    #[test]
    fn wrongly_typed_fields_are_rejected_as_candidates() {
        let raw = "{\"EmailResponseText\": \"a\", \"MustCreateAttachment\": \"yes\"}";
        let payload = parser().parse(raw, &ctx("", Some("en")));
        assert!(payload.explanation.unwrap().starts_with("Parse error:"));
    }

    fn sample_payload() -> ReplyPayload {
        ReplyPayload {
            text: "Your order ships tomorrow.\n\nBest regards".into(),
            subject: "RE: Order 42".into(),
            html: "<p>Your order ships tomorrow.</p><p>Best regards</p>".into(),
            explanation: Some("Checked the order status tool".into()),
            attachments: vec![Attachment {
                filename: "invoice.pdf".into(),
                content_type: "application/pdf".into(),
                content: Some("JVBERi0xLjc=".into()),
                path: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn serialized_reply_survives_a_fenced_block() {
        let payload = sample_payload();
        let json = serde_json::to_string_pretty(&payload).unwrap();
        let raw = format!("```json\n{}\n```\nLet me know if anything else is needed.", json);

        assert_eq!(parser().parse(&raw, &ctx("", None)), payload);

        // Prose ahead of the block replaces the explanation and nothing else.
        let raw = format!("Looked it up.\n```json\n{}\n```", json);
        let parsed = parser().parse(&raw, &ctx("", None));
        assert_eq!(
            parsed,
            ReplyPayload {
                explanation: Some("Looked it up.".into()),
                ..payload
            }
        );
    }

    #[test]
    fn serialized_reply_survives_the_brace_scan() {
        let payload = ReplyPayload {
            explanation: None,
            ..sample_payload()
        };
        let raw = serde_json::to_string(&payload).unwrap();
        assert_eq!(parser().parse(&raw, &ctx("", None)), payload);

        let parsed = parser().parse(&format!("Here you go:\n{}", raw), &ctx("", None));
        assert_eq!(
            parsed,
            ReplyPayload {
                explanation: Some("Here you go:".into()),
                ..payload
            }
        );
    }

    #[test]
    fn validator_accepts_minimal_object() {
        let validator = ReplyValidator::new().unwrap();
        assert!(validator.validate(&serde_json::json!({"EmailResponseText": "x"})));
        assert!(!validator.validate(&serde_json::json!(["x"])));
    }
}
