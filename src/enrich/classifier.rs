//! AI link classifier on rig-core's Anthropic provider.
//!
//! [`RigBackend`] bridges rig's `CompletionModel` to [`CompletionBackend`],
//! the one call the classifier needs. Prompt construction and response
//! parsing are plain functions so they can be tested without HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::message::AssistantContent;
use rig::completion::{CompletionError, CompletionModel, Message};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::enrich::{Classifier, RateLimitState};
use crate::error::EnrichmentError;
use crate::pipeline::types::Analysis;

const SERVICE: &str = "anthropic";

/// Max tokens for a classification (one category plus one sentence).
const CLASSIFY_MAX_TOKENS: u64 = 256;

const CLASSIFY_TEMPERATURE: f64 = 0.1;

/// How much fetched context goes into the prompt.
const CONTEXT_PREVIEW_CHARS: usize = 1500;

/// Default category set when none is configured.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "Tech", "Science", "Business", "Design", "News", "Culture", "Tutorial", "Tool", "Other",
];

// ── Completion backend ──────────────────────────────────────────────

/// A single system + user completion returning the model's text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, EnrichmentError>;
}

/// Adapter from a rig completion model to [`CompletionBackend`].
pub struct RigBackend<M> {
    model: M,
}

impl<M> RigBackend<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

/// Anthropic model through rig-core.
///
/// rig accepts any key string here; a bad key surfaces on the first
/// request as [`EnrichmentError::AuthFailed`].
pub fn anthropic_backend(api_key: &SecretString, model: &str) -> Result<Arc<dyn CompletionBackend>, EnrichmentError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(api_key.expose_secret()).map_err(|e| EnrichmentError::RequestFailed {
            service: SERVICE.into(),
            reason: format!("Failed to create Anthropic client: {e}"),
        })?;

    tracing::info!("Using Anthropic (model: {})", model);
    Ok(Arc::new(RigBackend::new(client.completion_model(model))))
}

#[async_trait]
impl<M> CompletionBackend for RigBackend<M>
where
    M: CompletionModel + 'static,
{
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, EnrichmentError> {
        let response = self
            .model
            .completion_request(Message::user(prompt))
            .preamble(system.to_string())
            .temperature(CLASSIFY_TEMPERATURE)
            .max_tokens(CLASSIFY_MAX_TOKENS)
            .send()
            .await
            .map_err(map_completion_error)?;

        Ok(response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect())
    }
}

/// rig reports a non-2xx Anthropic reply as `ProviderError(body)`: the
/// status line and headers are gone, only the error body is left.
fn map_completion_error(err: CompletionError) -> EnrichmentError {
    match err {
        CompletionError::ProviderError(body) | CompletionError::ResponseError(body) => provider_error(&body),
        other => EnrichmentError::RequestFailed {
            service: SERVICE.into(),
            reason: other.to_string(),
        },
    }
}

/// Classify an Anthropic error body by its `error.type`.
///
/// A throttle carries no reset time, so the caller falls back to its
/// configured window.
fn provider_error(body: &str) -> EnrichmentError {
    let lower = body.to_ascii_lowercase();
    if lower.contains("rate_limit_error") || lower.contains("rate limit") {
        EnrichmentError::RateLimited {
            service: SERVICE.into(),
            reset_at: None,
        }
    } else if lower.contains("authentication_error") || lower.contains("permission_error") {
        EnrichmentError::AuthFailed { service: SERVICE.into() }
    } else {
        EnrichmentError::RequestFailed {
            service: SERVICE.into(),
            reason: body.to_string(),
        }
    }
}

// ── Classifier ──────────────────────────────────────────────────────

/// Classifies links by asking the model for `{category, description}`.
pub struct AnthropicClassifier {
    backend: Arc<dyn CompletionBackend>,
    categories: Vec<String>,
    limiter: Arc<RateLimitState>,
}

impl AnthropicClassifier {
    pub fn new(api_key: &SecretString, model: &str, limiter: Arc<RateLimitState>) -> Result<Self, EnrichmentError> {
        Ok(Self::with_backend(anthropic_backend(api_key, model)?, limiter))
    }

    pub fn with_backend(backend: Arc<dyn CompletionBackend>, limiter: Arc<RateLimitState>) -> Self {
        Self {
            backend,
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            limiter,
        }
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        if !categories.is_empty() {
            self.categories = categories;
        }
        self
    }
}

#[async_trait]
impl Classifier for AnthropicClassifier {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn analyze(&self, identifier: &str, context: Option<&str>) -> Result<Analysis, EnrichmentError> {
        let system = build_classify_system_prompt(&self.categories);
        let prompt = build_classify_user_prompt(identifier, context);

        let text = match self.backend.complete(&system, &prompt).await {
            Ok(text) => text,
            Err(EnrichmentError::RateLimited { reset_at, .. }) => {
                self.limiter.mark_limited(reset_at);
                warn!(identifier, reset_at = ?reset_at, "Classifier rate limited");
                return Err(EnrichmentError::RateLimited {
                    service: SERVICE.into(),
                    reset_at,
                });
            }
            Err(e) => return Err(e),
        };

        let analysis = parse_analysis_response(&text).map_err(|reason| {
            warn!(raw_response = %text, error = %reason, "Failed to parse classification");
            EnrichmentError::InvalidResponse {
                service: SERVICE.into(),
                reason,
            }
        })?;
        debug!(identifier, category = %analysis.category, "Link classified");
        Ok(analysis)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_classify_system_prompt(categories: &[String]) -> String {
    format!(
        "You classify links for a personal reading list.\n\n\
         Pick exactly one category from: {}.\n\
         Write a one-sentence description of what the link is about.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"category\": \"...\", \"description\": \"...\"}}\n\n\
         Rules:\n\
         - Use \"Other\" when nothing fits\n\
         - Description max 30 words, no marketing language\n\
         - Base the description on the provided content when present",
        categories.join(", ")
    )
}

fn build_classify_user_prompt(identifier: &str, context: Option<&str>) -> String {
    let mut prompt = format!("Link: {identifier}\n");
    if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
        let preview: String = context.chars().take(CONTEXT_PREVIEW_CHARS).collect();
        prompt.push_str(&format!("\nContent:\n{preview}\n"));
    }
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    category: String,
    #[serde(default)]
    description: String,
}

/// Parse the model output into an [`Analysis`].
fn parse_analysis_response(raw: &str) -> Result<Analysis, String> {
    let json_str = extract_json_object(raw);
    let response: ClassifyResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let category = response.category.trim();
    if category.is_empty() {
        return Err("classification requires a category".into());
    }
    let description = response.description.trim();
    if description.is_empty() {
        return Err("classification requires a description".into());
    }
    Ok(Analysis::new(category, description))
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```") {
        let after = trimmed[start + 3..].trim_start_matches("json");
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
