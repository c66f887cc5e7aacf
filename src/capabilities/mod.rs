//! External capabilities the pipeline consumes.
//!
//! The orchestrator only sees these traits. Concrete adapters live in the
//! submodules: `fetcher` (HTTP), `llm` (Anthropic Messages API for both
//! analysis and drafting) and `dispatcher` (SMTP plus a dry-run sink).

pub mod dispatcher;
pub mod fetcher;
pub mod llm;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AnalyzeError, DraftError, FetchError, SendError};

pub use dispatcher::{DryRunDispatcher, SmtpConfig, SmtpDispatcher};
pub use fetcher::{HttpFetcher, HttpFetcherConfig, normalize_url};
pub use llm::{AnthropicClient, AnthropicConfig};

// ── Payloads ────────────────────────────────────────────────────────

/// One fetched page and its cleaned text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageText {
    pub page_url: String,
    pub text: String,
}

/// Ordered pages fetched for a prospect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub pages: Vec<PageText>,
}

impl PageContent {
    pub fn single(page_url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            pages: vec![PageText {
                page_url: page_url.into(),
                text: text.into(),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|p| p.text.trim().is_empty())
    }

    /// All pages joined with a per-page header.
    pub fn combined_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| format!("--- Page: {} ---\n{}", p.page_url, p.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Structured business analysis of a prospect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub company_name: String,
    pub summary: String,
    pub industry: String,
    #[serde(default)]
    pub services: BTreeSet<String>,
    #[serde(default)]
    pub pain_points: Vec<String>,
    #[serde(default)]
    pub opportunities: Vec<String>,
    pub value_proposition: String,
    pub outreach_angle: String,
}

/// A generated message ready for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub subject: String,
    pub body: String,
}

/// Proof of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
}

// ── Tone ────────────────────────────────────────────────────────────

/// Voice the drafter writes in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    #[default]
    Professional,
    Conversational,
    Bold,
    Consultative,
}

impl Tone {
    pub const ALL: [Tone; 4] = [
        Self::Professional,
        Self::Conversational,
        Self::Bold,
        Self::Consultative,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Professional => "professional",
            Self::Conversational => "conversational",
            Self::Bold => "bold",
            Self::Consultative => "consultative",
        }
    }

    /// Writing guidance handed to the drafter.
    pub fn guidance(self) -> &'static str {
        match self {
            Self::Professional => {
                "Professional and polished. Business-appropriate language, clear and direct."
            }
            Self::Conversational => {
                "Friendly and conversational. Warm but still professional. Like talking to a smart colleague."
            }
            Self::Bold => {
                "Confident and bold. Direct, slightly provocative, pattern-interrupting. Stands out in an inbox."
            }
            Self::Consultative => {
                "Thoughtful and consultative. Lead with insights and questions. Position as a strategic advisor."
            }
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown tone '{s}' (expected professional, conversational, bold or consultative)"))
    }
}

// ── Capability traits ───────────────────────────────────────────────

/// Retrieves public web content for a prospect URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<PageContent, FetchError>;
}

/// Turns page content into a structured analysis.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, content: &PageContent) -> Result<Analysis, AnalyzeError>;
}

/// Writes a message from an analysis in the requested tone.
#[async_trait]
pub trait Drafter: Send + Sync {
    async fn draft(&self, analysis: &Analysis, tone: Tone) -> Result<EmailDraft, DraftError>;
}

/// Delivers a draft to a recipient.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, draft: &EmailDraft, recipient: &str) -> Result<SendReceipt, SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_parses_case_insensitively() {
        assert_eq!("Bold".parse::<Tone>().unwrap(), Tone::Bold);
        assert_eq!(" consultative ".parse::<Tone>().unwrap(), Tone::Consultative);
        assert!("snarky".parse::<Tone>().is_err());
    }

    #[test]
    fn page_content_emptiness_ignores_whitespace() {
        assert!(PageContent::default().is_empty());
        assert!(PageContent::single("https://a.test", "  \n").is_empty());
        assert!(!PageContent::single("https://a.test", "hello").is_empty());
    }

    #[test]
    fn combined_text_keeps_page_order() {
        let content = PageContent {
            pages: vec![
                PageText {
                    page_url: "https://a.test".into(),
                    text: "home".into(),
                },
                PageText {
                    page_url: "https://a.test/about".into(),
                    text: "about".into(),
                },
            ],
        };
        let text = content.combined_text();
        assert!(text.find("home").unwrap() < text.find("about").unwrap());
    }
}
