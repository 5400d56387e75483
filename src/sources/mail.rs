//! Mail message parsing shared by the mailbox, directory and IMAP sources.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use tracing::warn;

use crate::pipeline::types::RawItem;

static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhref\s*=\s*["']([^"']+)["']"#).expect("valid href regex")
});

/// Parse one RFC 822 message into a raw item.
///
/// Returns `None` when the bytes are not a message at all.
pub fn parse_message(bytes: &[u8], origin: &str) -> Option<RawItem> {
    let parsed = MessageParser::default().parse(bytes)?;

    let body = strip_quoted_text(&extract_text(&parsed));
    let mut item = RawItem::new(origin, body);
    if let Some(subject) = parsed.subject() {
        item = item.with_subject(subject);
    }
    if let Some(at) = parsed.date().and_then(to_utc) {
        item = item.with_received_at(at);
    }
    Some(item)
}

/// Parse a batch of messages, in order.
///
/// A message that does not parse is logged and skipped; the rest are kept.
pub fn parse_messages<'a>(messages: impl IntoIterator<Item = &'a [u8]>, origin: &str) -> Vec<RawItem> {
    messages
        .into_iter()
        .enumerate()
        .filter_map(|(position, bytes)| {
            let item = parse_message(bytes, origin);
            if item.is_none() {
                warn!(origin, position, "Skipping unparseable message");
            }
            item
        })
        .collect()
}

/// Readable text of a parsed message.
///
/// The parser renders HTML-only bodies as text and drops anchor targets
/// on the way, so hrefs from the HTML rendering are appended.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        let mut text = text.to_string();
        if let Some(html) = parsed.body_html(0) {
            for href in html_links(html.as_ref()) {
                text.push('\n');
                text.push_str(&href);
            }
        }
        return text;
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

fn html_links(html: &str) -> Vec<String> {
    HREF_RE
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().replace("&amp;", "&"))
        .filter(|href| href.starts_with("http"))
        .collect()
}

fn to_utc(d: &mail_parser::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(d.to_timestamp(), 0)
}

/// Strip tags from HTML, keeping link targets.
///
/// Anchor `href` values are emitted as text so link extraction still sees
/// them after the markup is gone.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut tag = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                if let Some(href) = HREF_RE.captures(&tag).and_then(|c| c.get(1)) {
                    result.push(' ');
                    result.push_str(&href.as_str().replace("&amp;", "&"));
                    result.push(' ');
                }
                result.push(' ');
            }
            _ if in_tag => tag.push(ch),
            _ => result.push(ch),
        }
    }
    decode_entities(&result.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Strip quoted reply text from a message body.
///
/// Drops `>`-prefixed lines, and everything after an "On ... wrote:"
/// attribution or an "Original Message" separator.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}
