//! Link extraction and identifier normalization.
//!
//! Pure string handling, no I/O. Normalization is idempotent: feeding an
//! already-normalized identifier back in returns it unchanged.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhttps?://[^\s<>"'\[\]{}|\\^`]+"#).expect("link regex is valid")
});

/// Characters that commonly trail a URL in prose but are not part of it.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '>', '\'', '"'];

/// Query parameters that only carry tracking state.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref_src", "igshid"];

/// Substrings marking links that are mail plumbing rather than content.
const NOISE_MARKERS: &[&str] = &["unsubscribe", "list-manage.com", "email-preferences", "/optout"];

/// Canonical form of a link identifier.
///
/// - trims whitespace
/// - lowercases scheme and host
/// - drops the fragment and tracking query parameters (`utm_*`, `fbclid`, ...)
///
/// Non-http(s) or unparseable input is returned trimmed.
pub fn normalize_identifier(raw: &str) -> String {
    let trimmed = raw.trim();

    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return trimmed.to_string();
    }

    url.set_fragment(None);

    if url.query().is_some() {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let kept: Vec<&(String, String)> = pairs.iter().filter(|(k, _)| !is_tracking_param(k)).collect();

        if kept.is_empty() {
            url.set_query(None);
        } else if kept.len() != pairs.len() {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
    }

    url.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// True for unsubscribe/preference links that carry no content.
pub fn is_noise_link(identifier: &str) -> bool {
    let lower = identifier.to_ascii_lowercase();
    NOISE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Extract distinct, normalized content links from text, in order of
/// first appearance.
///
/// Prose punctuation trailing a match is dropped here, before
/// normalization, so a normalized identifier may still end in `.`.
pub fn extract_links(text: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for m in LINK_RE.find_iter(text) {
        let link = normalize_identifier(m.as_str().trim_end_matches(TRAILING_PUNCTUATION));
        if is_noise_link(&link) || links.contains(&link) {
            continue;
        }
        links.push(link);
    }
    links
}

/// Host of an identifier, lowercased, without a leading `www.`.
pub fn host_of(identifier: &str) -> Option<String> {
    let url = Url::parse(identifier).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}

/// True for links to a social post that needs its text fetched before
/// it can be classified.
pub fn is_social_post(identifier: &str) -> bool {
    let Some(host) = host_of(identifier) else {
        return false;
    };
    matches!(host.as_str(), "twitter.com" | "x.com" | "mobile.twitter.com") && identifier.contains("/status/")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── normalize_identifier ────────────────────────────────────

    #[test]
    fn lowercases_host_and_scheme() {
        assert_eq!(normalize_identifier("HTTPS://Example.COM/Path"), "https://example.com/Path");
    }

    #[test]
    fn strips_tracking_params_and_fragment() {
        assert_eq!(
            normalize_identifier("https://example.com/a?utm_source=x&utm_medium=y#top"),
            "https://example.com/a"
        );
        assert_eq!(
            normalize_identifier("https://example.com/a?id=7&fbclid=abc"),
            "https://example.com/a?id=7"
        );
    }

    #[test]
    fn keeps_untracked_query_untouched() {
        assert_eq!(
            normalize_identifier("https://example.com/search?q=rust+async"),
            "https://example.com/search?q=rust+async"
        );
    }

    #[test]
    fn keeps_trailing_dot_left_by_stripped_tracking_param() {
        let once = normalize_identifier("https://example.com/a?x=.&utm_source=1");
        assert_eq!(once, "https://example.com/a?x=.");
        assert_eq!(normalize_identifier(&once), once);
    }

    #[test]
    fn non_http_passthrough() {
        assert_eq!(normalize_identifier("  mailto:a@b.com "), "mailto:a@b.com");
        assert_eq!(normalize_identifier("not a url"), "not a url");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "HTTPS://Example.COM/path?utm_source=mail&id=4#frag",
            "https://example.com",
            "https://x.com/u/status/12?s=20",
            "https://a.com/x?",
            "https://example.com/a?x=.&utm_source=1",
            "https://example.com/end.",
        ] {
            let once = normalize_identifier(raw);
            assert_eq!(normalize_identifier(&once), once, "input: {raw}");
        }
    }

    // ── extract_links ───────────────────────────────────────────

    #[test]
    fn extracts_links_in_order() {
        let text = "See https://blog.rust-lang.org/post, and also (https://docs.rs/tokio).";
        assert_eq!(
            extract_links(text),
            vec!["https://blog.rust-lang.org/post", "https://docs.rs/tokio"]
        );
    }

    #[test]
    fn trims_trailing_punctuation_from_matches() {
        assert_eq!(
            extract_links("read https://example.com/post). now"),
            vec!["https://example.com/post"]
        );
    }

    #[test]
    fn dedups_after_normalization() {
        let text = "https://example.com/a?utm_source=x then https://EXAMPLE.com/a";
        assert_eq!(extract_links(text), vec!["https://example.com/a"]);
    }

    #[test]
    fn skips_unsubscribe_links() {
        let text = "Read https://example.com/article\nUnsubscribe: https://example.com/unsubscribe?u=1";
        assert_eq!(extract_links(text), vec!["https://example.com/article"]);
    }

    #[test]
    fn no_links_in_plain_text() {
        assert!(extract_links("nothing to see here").is_empty());
    }

    #[test]
    fn extracts_from_html_attribute_boundaries() {
        let text = r#"<a href="https://example.com/x">link</a>"#;
        assert_eq!(extract_links(text), vec!["https://example.com/x"]);
    }

    // ── host helpers ────────────────────────────────────────────

    #[test]
    fn host_strips_www() {
        assert_eq!(host_of("https://www.Example.com/a").as_deref(), Some("example.com"));
        assert_eq!(host_of("nope"), None);
    }

    #[test]
    fn social_post_detection() {
        assert!(is_social_post("https://x.com/rustlang/status/123"));
        assert!(is_social_post("https://twitter.com/rustlang/status/123"));
        assert!(!is_social_post("https://x.com/rustlang"));
        assert!(!is_social_post("https://example.com/status/1"));
    }
}
