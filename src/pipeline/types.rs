//! Shared types for the outreach pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Classification ──────────────────────────────────────────────────

/// Closed failure vocabulary shared by every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    TransientNetwork,
    RateLimited,
    InvalidInput,
    AuthError,
    RecipientRejected,
    MalformedResponse,
    Cancelled,
    Unknown,
}

impl Classification {
    pub const ALL: [Classification; 8] = [
        Self::TransientNetwork,
        Self::RateLimited,
        Self::InvalidInput,
        Self::AuthError,
        Self::RecipientRejected,
        Self::MalformedResponse,
        Self::Cancelled,
        Self::Unknown,
    ];

    /// Whether a failure with this classification may be retried at `stage`.
    ///
    /// `malformed_response` is only recoverable on the LLM-backed stages,
    /// where a fresh call can produce a parseable answer.
    pub fn is_retryable_for(self, stage: StageKind) -> bool {
        match self {
            Self::TransientNetwork | Self::RateLimited => true,
            Self::MalformedResponse => stage.is_generative(),
            Self::InvalidInput
            | Self::AuthError
            | Self::RecipientRejected
            | Self::Cancelled
            | Self::Unknown => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::InvalidInput => "invalid_input",
            Self::AuthError => "auth_error",
            Self::RecipientRejected => "recipient_rejected",
            Self::MalformedResponse => "malformed_response",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown classification: {s}"))
    }
}

// ── Stage kind ──────────────────────────────────────────────────────

/// The four executable stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Scrape,
    Analyze,
    Draft,
    Send,
}

impl StageKind {
    /// Stages backed by a text-generation service.
    pub fn is_generative(self) -> bool {
        matches!(self, Self::Analyze | Self::Draft)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Analyze => "analyze",
            Self::Draft => "draft",
            Self::Send => "send",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Stage result ────────────────────────────────────────────────────

/// Uniform outcome of one executor invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult<T> {
    Success(T),
    RetryableFailure {
        classification: Classification,
        detail: String,
    },
    FatalFailure {
        classification: Classification,
        detail: String,
    },
}

impl<T> StageResult<T> {
    /// Build a failure, choosing retryable or fatal from the classification.
    pub fn failure(stage: StageKind, classification: Classification, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if classification.is_retryable_for(stage) {
            Self::RetryableFailure {
                classification,
                detail,
            }
        } else {
            Self::FatalFailure {
                classification,
                detail,
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn classification(&self) -> Option<Classification> {
        match self {
            Self::Success(_) => None,
            Self::RetryableFailure { classification, .. }
            | Self::FatalFailure { classification, .. } => Some(*classification),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_recipient_are_fatal_everywhere() {
        for stage in [StageKind::Scrape, StageKind::Analyze, StageKind::Draft, StageKind::Send] {
            assert!(!Classification::AuthError.is_retryable_for(stage));
            assert!(!Classification::RecipientRejected.is_retryable_for(stage));
            assert!(Classification::TransientNetwork.is_retryable_for(stage));
            assert!(Classification::RateLimited.is_retryable_for(stage));
        }
    }

    #[test]
    fn malformed_response_only_retryable_on_generative_stages() {
        assert!(Classification::MalformedResponse.is_retryable_for(StageKind::Analyze));
        assert!(Classification::MalformedResponse.is_retryable_for(StageKind::Draft));
        assert!(!Classification::MalformedResponse.is_retryable_for(StageKind::Scrape));
        assert!(!Classification::InvalidInput.is_retryable_for(StageKind::Analyze));
    }

    #[test]
    fn classification_string_roundtrip() {
        for c in Classification::ALL {
            assert_eq!(c.as_str().parse::<Classification>().unwrap(), c);
        }
        assert!("bogus".parse::<Classification>().is_err());
    }

    #[test]
    fn failure_constructor_picks_variant() {
        let r: StageResult<()> = StageResult::failure(StageKind::Send, Classification::AuthError, "535");
        assert!(matches!(r, StageResult::FatalFailure { .. }));
        let r: StageResult<()> =
            StageResult::failure(StageKind::Send, Classification::TransientNetwork, "reset");
        assert!(matches!(r, StageResult::RetryableFailure { .. }));
    }
}
