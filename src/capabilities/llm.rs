//! Anthropic Messages API client serving as both Analyzer and Drafter.
//!
//! Responses are expected to be a single JSON object. Anything that does
//! not parse into the expected shape is reported as `malformed_response`
//! so the retry policy can ask again within its reformulation budget.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Analysis, Analyzer, Drafter, EmailDraft, PageContent, Tone};
use crate::error::{AnalyzeError, ConfigError, DraftError};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Characters of page text sent for analysis.
const MAX_ANALYSIS_CHARS: usize = 15_000;

const ANALYSIS_MAX_TOKENS: u32 = 2000;
const DRAFT_MAX_TOKENS: u32 = 1000;

/// Client settings.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: SecretString,
    pub model: String,
    pub timeout: Duration,
    /// Name the drafts are signed with.
    pub sender_name: String,
    /// One paragraph describing what the sender offers.
    pub sender_pitch: String,
}

impl AnthropicConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            model: "claude-sonnet-4-20250514".to_string(),
            timeout: Duration::from_secs(120),
            sender_name: "The Outreach Team".to_string(),
            sender_pitch: "We build custom AI and automation solutions embedded directly in client workflows.".to_string(),
        }
    }
}

/// Failure of one Messages API round trip, before stage-specific mapping.
#[derive(Debug)]
enum CallFailure {
    RateLimited(String),
    Network(String),
    Malformed(String),
    Rejected(String),
}

impl From<CallFailure> for AnalyzeError {
    fn from(f: CallFailure) -> Self {
        match f {
            CallFailure::RateLimited(m) => Self::RateLimited(m),
            CallFailure::Network(m) => Self::TransientNetwork(m),
            CallFailure::Malformed(m) => Self::MalformedResponse(m),
            CallFailure::Rejected(m) => Self::Other(m),
        }
    }
}

impl From<CallFailure> for DraftError {
    fn from(f: CallFailure) -> Self {
        match f {
            CallFailure::RateLimited(m) => Self::RateLimited(m),
            CallFailure::Network(m) => Self::TransientNetwork(m),
            CallFailure::Malformed(m) => Self::MalformedResponse(m),
            CallFailure::Rejected(m) => Self::Other(m),
        }
    }
}

/// Anthropic-backed analyzer and drafter.
pub struct AnthropicClient {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Result<Self, ConfigError> {
        if config.api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "http_client".into(),
                message: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send one system + user exchange and return the concatenated text blocks.
    async fn complete(&self, system: &str, user: String, max_tokens: u32) -> Result<String, CallFailure> {
        let body = json!({
            "model": self.config.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": [{ "role": "user", "content": user }],
        });

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", self.config.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CallFailure::Network(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .unwrap_or("unspecified")
                .to_string();
            return Err(CallFailure::RateLimited(format!(
                "rate limited (retry-after {retry_after})"
            )));
        }
        if status.is_server_error() || status.as_u16() == 529 {
            return Err(CallFailure::Network(format!("API returned {status}")));
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(CallFailure::Rejected(format!("API error {status}: {error_body}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CallFailure::Malformed(format!("response body is not JSON: {e}")))?;
        let text = response_text(&payload);
        if text.trim().is_empty() {
            return Err(CallFailure::Malformed("response contained no text".into()));
        }
        Ok(text)
    }
}

/// Concatenate the `text` content blocks of a Messages API response.
fn response_text(payload: &Value) -> String {
    payload["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"].as_str() == Some("text"))
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Pull a JSON object out of model output that may be fenced or chatty.
fn extract_json_object(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return trimmed;
    }
    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('{') {
                    return inner;
                }
            }
        }
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

// ── Analysis ────────────────────────────────────────────────────────

const ANALYSIS_SYSTEM: &str = "You are a business development analyst. You read a \
prospect's public website and describe, as structured JSON, what the company does, where \
it is likely struggling, and where the sender's services could help. Ground every point \
in the supplied content; when the content is thin, say so and infer from the industry.";

fn analysis_prompt(content: &PageContent, pitch: &str) -> String {
    let mut text = content.combined_text();
    if text.chars().count() > MAX_ANALYSIS_CHARS {
        text = text.chars().take(MAX_ANALYSIS_CHARS).collect();
        text.push_str("\n\n... [content truncated for analysis]");
    }
    let source = content
        .pages
        .first()
        .map(|p| p.page_url.as_str())
        .unwrap_or("unknown");

    format!(
        r#"What the sender offers: {pitch}

Website: {source}

Content:
{text}

Respond with ONLY a JSON object with these fields:
{{
  "company_name": "the company's name",
  "summary": "2-3 sentences on what the company does and for whom",
  "industry": "primary industry",
  "services": ["their main products or services"],
  "pain_points": ["concrete challenges, each tied to evidence on the site"],
  "opportunities": ["concrete ways the sender could help"],
  "value_proposition": "2-3 sentences on why the sender fits this company",
  "outreach_angle": "the single most compelling hook for a first message"
}}"#
    )
}

fn parse_analysis(text: &str) -> Result<Analysis, AnalyzeError> {
    let analysis: Analysis = serde_json::from_str(extract_json_object(text))
        .map_err(|e| AnalyzeError::MalformedResponse(format!("analysis JSON: {e}")))?;
    if analysis.summary.trim().is_empty() || analysis.outreach_angle.trim().is_empty() {
        return Err(AnalyzeError::MalformedResponse(
            "analysis is missing summary or outreach_angle".into(),
        ));
    }
    Ok(analysis)
}

#[async_trait]
impl Analyzer for AnthropicClient {
    async fn analyze(&self, content: &PageContent) -> Result<Analysis, AnalyzeError> {
        let prompt = analysis_prompt(content, &self.config.sender_pitch);
        debug!(model = %self.config.model, chars = prompt.len(), "Requesting analysis");

        let text = self.complete(ANALYSIS_SYSTEM, prompt, ANALYSIS_MAX_TOKENS).await?;
        let analysis = parse_analysis(&text).inspect_err(|e| {
            warn!(error = %e, preview = %text.chars().take(200).collect::<String>(), "Unparseable analysis");
        })?;

        info!(company = %analysis.company_name, industry = %analysis.industry, "Analysis complete");
        Ok(analysis)
    }
}

// ── Drafting ────────────────────────────────────────────────────────

const DRAFT_SYSTEM: &str = "You write short first-contact emails that read as personally \
written. Open with a specific detail from the prospect's website, lead with value rather \
than a pitch, keep the body under 200 words, and end with one low-friction call to action. \
Subject lines stay under 60 characters.";

#[derive(Deserialize)]
struct RawDraft {
    subject: String,
    body: String,
}

fn draft_prompt(analysis: &Analysis, tone: Tone, sender_name: &str) -> Result<String, DraftError> {
    let analysis_json = serde_json::to_string_pretty(analysis)
        .map_err(|e| DraftError::Other(format!("serialize analysis: {e}")))?;
    Ok(format!(
        r#"Prospect analysis:
{analysis_json}

Tone: {tone}. {guidance}

Sign off as: {sender_name}

Respond with ONLY a JSON object:
{{
  "subject": "subject line",
  "body": "full email body, \n for line breaks"
}}"#,
        guidance = tone.guidance(),
    ))
}

fn parse_draft(text: &str) -> Result<EmailDraft, DraftError> {
    let raw: RawDraft = serde_json::from_str(extract_json_object(text))
        .map_err(|e| DraftError::MalformedResponse(format!("draft JSON: {e}")))?;
    let subject = raw.subject.trim().trim_matches('"').to_string();
    let body = raw.body.trim().to_string();
    if subject.is_empty() || body.is_empty() {
        return Err(DraftError::MalformedResponse("draft has an empty subject or body".into()));
    }
    Ok(EmailDraft { subject, body })
}

#[async_trait]
impl Drafter for AnthropicClient {
    async fn draft(&self, analysis: &Analysis, tone: Tone) -> Result<EmailDraft, DraftError> {
        let prompt = draft_prompt(analysis, tone, &self.config.sender_name)?;
        debug!(model = %self.config.model, %tone, "Requesting draft");

        let text = self.complete(DRAFT_SYSTEM, prompt, DRAFT_MAX_TOKENS).await?;
        let draft = parse_draft(&text)?;

        info!(subject = %draft.subject, %tone, "Draft generated");
        Ok(draft)
    }
}
