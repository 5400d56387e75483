//! Content fetchers: social-post text and page metadata.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::enrich::{ContentFetcher, RateLimitState, reset_from_headers};
use crate::error::EnrichmentError;
use crate::sources::mail::strip_html;

const OEMBED_URL: &str = "https://publish.twitter.com/oembed";

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Cap on page bytes scanned for metadata.
const MAX_PAGE_BYTES: usize = 256 * 1024;

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"));

static META_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<meta\s[^>]*(?:name|property)\s*=\s*["'](og:description|description|og:title)["'][^>]*>"#)
        .expect("valid meta regex")
});

static CONTENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)\bcontent\s*=\s*["']([^"']*)["']"#).expect("valid content regex"));

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(concat!("linkflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

fn request_failed(service: &str, e: impl std::fmt::Display) -> EnrichmentError {
    EnrichmentError::RequestFailed {
        service: service.into(),
        reason: e.to_string(),
    }
}

// ── oEmbed ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    #[serde(default)]
    author_name: String,
    #[serde(default)]
    html: String,
}

/// Social-post text through the public oEmbed endpoint.
///
/// A 429 records the advertised reset in the shared [`RateLimitState`].
pub struct OEmbedFetcher {
    client: reqwest::Client,
    endpoint: String,
    limiter: Arc<RateLimitState>,
}

impl OEmbedFetcher {
    pub fn new(limiter: Arc<RateLimitState>) -> Self {
        Self {
            client: client(),
            endpoint: OEMBED_URL.to_string(),
            limiter,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ContentFetcher for OEmbedFetcher {
    fn name(&self) -> &str {
        "oembed"
    }

    async fn fetch_content(&self, identifier: &str) -> Result<Option<String>, EnrichmentError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("url", identifier), ("omit_script", "true")])
            .send()
            .await
            .map_err(|e| request_failed(self.name(), e))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                let reset_at = reset_from_headers(response.headers(), Utc::now());
                self.limiter.mark_limited(reset_at);
                warn!(identifier, reset_at = ?reset_at, "oEmbed rate limited");
                return Err(EnrichmentError::RateLimited {
                    service: self.name().into(),
                    reset_at,
                });
            }
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                debug!(identifier, "Post not available");
                return Ok(None);
            }
            StatusCode::UNAUTHORIZED => {
                return Err(EnrichmentError::AuthFailed {
                    service: self.name().into(),
                });
            }
            s if !s.is_success() => return Err(request_failed(self.name(), format!("HTTP {s}"))),
            _ => {}
        }

        let body = response.text().await.map_err(|e| request_failed(self.name(), e))?;
        let embed: OEmbedResponse = serde_json::from_str(&body)?;
        Ok(post_text(&embed))
    }
}

fn post_text(embed: &OEmbedResponse) -> Option<String> {
    let text = strip_html(&embed.html);
    if text.is_empty() {
        return None;
    }
    if embed.author_name.is_empty() {
        Some(text)
    } else {
        Some(format!("{}: {text}", embed.author_name))
    }
}

// ── Page metadata ───────────────────────────────────────────────────

/// Fallback content: a page's `<title>` and description meta tags.
///
/// Any failure, throttling included, is reported as "no content" so the
/// caller can carry on without it.
pub struct PageMetaFetcher {
    client: reqwest::Client,
}

impl PageMetaFetcher {
    pub fn new() -> Self {
        Self { client: client() }
    }
}

impl Default for PageMetaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentFetcher for PageMetaFetcher {
    fn name(&self) -> &str {
        "page-meta"
    }

    async fn fetch_content(&self, identifier: &str) -> Result<Option<String>, EnrichmentError> {
        let response = match self.client.get(identifier).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(identifier, error = %e, "Page fetch failed");
                return Ok(None);
            }
        };
        if !response.status().is_success() {
            debug!(identifier, status = %response.status(), "Page fetch returned an error status");
            return Ok(None);
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(identifier, error = %e, "Page body read failed");
                return Ok(None);
            }
        };
        let html = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_PAGE_BYTES)]);
        Ok(page_summary(&html))
    }
}

/// Title and description of an HTML page, one per line.
fn page_summary(html: &str) -> Option<String> {
    let title = TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| strip_html(m.as_str()));

    let mut description = None;
    let mut og_title = None;
    for tag in META_RE.captures_iter(html) {
        let (Some(kind), Some(content)) = (
            tag.get(1).map(|m| m.as_str().to_ascii_lowercase()),
            CONTENT_RE.captures(tag.get(0).map_or("", |m| m.as_str())).and_then(|c| c.get(1)),
        ) else {
            continue;
        };
        let content = strip_html(content.as_str());
        match kind.as_str() {
            "og:description" => description = Some(content),
            "description" => {
                description.get_or_insert(content);
            }
            _ => {
                og_title.get_or_insert(content);
            }
        }
    }

    let parts: Vec<String> = [title.or(og_title), description]
        .into_iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() { None } else { Some(parts.join("\n")) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_text_with_author() {
        let embed = OEmbedResponse {
            author_name: "Rust Language".into(),
            html: r#"<blockquote><p>Rust 1.90 is out!</p>&mdash; <a href="https://t.co/abc">link</a></blockquote>"#
                .into(),
        };
        let text = post_text(&embed).unwrap();
        assert!(text.starts_with("Rust Language: Rust 1.90 is out!"));
        assert!(text.contains("https://t.co/abc"));
    }

    #[test]
    fn empty_embed_has_no_text() {
        let embed = OEmbedResponse {
            author_name: "someone".into(),
            html: String::new(),
        };
        assert_eq!(post_text(&embed), None);
    }

    #[test]
    fn oembed_response_tolerates_missing_fields() {
        let embed: OEmbedResponse = serde_json::from_str(r#"{"html": "<p>hi</p>"}"#).unwrap();
        assert_eq!(post_text(&embed).as_deref(), Some("hi"));
    }

    #[test]
    fn page_summary_prefers_og_description() {
        let html = r#"<html><head>
            <title>Async Rust &amp; You</title>
            <meta name="description" content="plain description">
            <meta property="og:description" content="Social description">
            </head></html>"#;
        assert_eq!(
            page_summary(html).as_deref(),
            Some("Async Rust & You\nSocial description")
        );
    }

    #[test]
    fn page_summary_falls_back_to_og_title() {
        let html = r#"<meta property="og:title" content="Only OG"><meta name="description" content="desc">"#;
        assert_eq!(page_summary(html).as_deref(), Some("Only OG\ndesc"));
    }

    #[test]
    fn page_without_metadata() {
        assert_eq!(page_summary("<html><body>hello</body></html>"), None);
    }
}
