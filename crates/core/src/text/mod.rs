pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wraps escaped text in a single paragraph.
pub fn paragraph(text: &str) -> String {
    format!("<p>{}</p>", escape_html(text))
}

/// Minimal HTML document for mail that only has a text body.
pub fn text_to_html_document(text: &str) -> String {
    let body = escape_html(text).replace("\r\n", "\n").replace('\n', "<br/>");
    format!("<html><body>{}</body></html>", body)
}

/// Cuts `input` to at most `max_bytes` without splitting a character.
pub fn truncate_bytes(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let mut end = max_bytes;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }

    #[test]
    fn html_document_keeps_line_breaks() {
        assert_eq!(
            text_to_html_document("Hi\r\nthere <b>"),
            "<html><body>Hi<br/>there &lt;b&gt;</body></html>"
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_bytes("äbc", 1), "");
        assert_eq!(truncate_bytes("äbc", 2), "ä");
        assert_eq!(truncate_bytes("abc", 10), "abc");
    }
}
