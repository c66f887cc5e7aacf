//! Outreach record and its attempt log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capabilities::{Analysis, PageContent, SendReceipt, Tone};
use crate::outreach::state::{FailureReport, Projection, TransitionError};
use crate::pipeline::types::{Classification, StageKind};

// ── Stage ───────────────────────────────────────────────────────────

/// Lifecycle stage of a record. Always a projection of the attempt log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Created, nothing fetched yet.
    New,
    Scraped,
    Analyzed,
    Drafted,
    AwaitingConfirmation,
    Sent,
    Opened,
    Replied,
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Self::New,
        Self::Scraped,
        Self::Analyzed,
        Self::Drafted,
        Self::AwaitingConfirmation,
        Self::Sent,
        Self::Opened,
        Self::Replied,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Scraped => "scraped",
            Self::Analyzed => "analyzed",
            Self::Drafted => "drafted",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Sent => "sent",
            Self::Opened => "opened",
            Self::Replied => "replied",
            Self::Failed => "failed",
        }
    }

    /// Stages an explicit abort may end.
    pub fn is_abortable(self) -> bool {
        matches!(
            self,
            Self::New | Self::Scraped | Self::Analyzed | Self::Drafted | Self::AwaitingConfirmation
        )
    }

    /// Stages reached only after a successful send.
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Sent | Self::Opened | Self::Replied)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }

    /// The stage that would run next from here, if any.
    pub fn pending_step(self) -> Option<StageKind> {
        match self {
            Self::New => Some(StageKind::Scrape),
            Self::Scraped => Some(StageKind::Analyze),
            Self::Analyzed => Some(StageKind::Draft),
            Self::Drafted | Self::AwaitingConfirmation => Some(StageKind::Send),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

// ── Attempt events ──────────────────────────────────────────────────

/// What an attempt event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Scrape,
    Analyze,
    Draft,
    Regenerate,
    /// Manual change to the draft's subject or body.
    Edit,
    RequestSend,
    Confirm,
    Send,
    MarkOpened,
    MarkReplied,
    Abort,
}

impl AttemptKind {
    pub const ALL: [AttemptKind; 11] = [
        Self::Scrape,
        Self::Analyze,
        Self::Draft,
        Self::Regenerate,
        Self::Edit,
        Self::RequestSend,
        Self::Confirm,
        Self::Send,
        Self::MarkOpened,
        Self::MarkReplied,
        Self::Abort,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Analyze => "analyze",
            Self::Draft => "draft",
            Self::Regenerate => "regenerate",
            Self::Edit => "edit",
            Self::RequestSend => "request_send",
            Self::Confirm => "confirm",
            Self::Send => "send",
            Self::MarkOpened => "mark_opened",
            Self::MarkReplied => "mark_replied",
            Self::Abort => "abort",
        }
    }

    /// Executor stage behind this kind, if it invokes one.
    pub fn stage_kind(self) -> Option<StageKind> {
        match self {
            Self::Scrape => Some(StageKind::Scrape),
            Self::Analyze => Some(StageKind::Analyze),
            Self::Draft | Self::Regenerate => Some(StageKind::Draft),
            Self::Send => Some(StageKind::Send),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown attempt kind: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::FatalFailure => "fatal_failure",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "retryable_failure" => Ok(Self::RetryableFailure),
            "fatal_failure" => Ok(Self::FatalFailure),
            other => Err(format!("unknown attempt outcome: {other}")),
        }
    }
}

/// One entry of the append-only attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvent {
    /// 1-based position in the log. Assigned when the event is committed.
    pub seq: u32,
    pub kind: AttemptKind,
    pub outcome: AttemptOutcome,
    /// Set on the failure that moved the record to `failed`.
    #[serde(default)]
    pub terminal: bool,
    pub classification: Option<Classification>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AttemptEvent {
    pub fn success(kind: AttemptKind, at: DateTime<Utc>) -> Self {
        Self {
            seq: 0,
            kind,
            outcome: AttemptOutcome::Success,
            terminal: false,
            classification: None,
            detail: None,
            at,
        }
    }

    pub fn failure(
        kind: AttemptKind,
        outcome: AttemptOutcome,
        classification: Classification,
        detail: impl Into<String>,
        terminal: bool,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            kind,
            outcome,
            terminal,
            classification: Some(classification),
            detail: Some(detail.into()),
            at,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

// ── Artifacts & tracking ────────────────────────────────────────────

/// The current draft. Regeneration replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub subject: String,
    pub body: String,
    pub tone: Tone,
    pub generated_at: DateTime<Utc>,
}

/// A timestamped free-text note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// Externally asserted follow-up state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracking {
    pub opened_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub follow_up_due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<Note>,
}

// ── Record ──────────────────────────────────────────────────────────

/// One prospect URL and everything that happened to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutreachRecord {
    pub id: String,
    pub url: String,
    pub stage: Stage,
    pub recipient: Option<String>,
    pub content: Option<PageContent>,
    pub analysis: Option<Analysis>,
    pub draft: Option<Draft>,
    pub sent_at: Option<DateTime<Utc>>,
    pub receipt: Option<SendReceipt>,
    #[serde(default)]
    pub tracking: Tracking,
    #[serde(default)]
    pub attempts: Vec<AttemptEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutreachRecord {
    pub fn new(url: impl Into<String>, now: DateTime<Utc>) -> Self {
        let url = url.into();
        Self {
            id: record_id(&url, now),
            url,
            stage: Stage::New,
            recipient: None,
            content: None,
            analysis: None,
            draft: None,
            sent_at: None,
            receipt: None,
            tracking: Tracking::default(),
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild the projection from the attempt log.
    pub fn projection(&self) -> Result<Projection, TransitionError> {
        Projection::replay(&self.attempts)
    }

    /// Where and why the record failed, if it did.
    pub fn failure(&self) -> Option<FailureReport> {
        self.projection().ok().and_then(|p| p.failure)
    }

    /// Events of one kind, in log order.
    pub fn attempts_of(&self, kind: AttemptKind) -> impl Iterator<Item = &AttemptEvent> {
        self.attempts.iter().filter(move |a| a.kind == kind)
    }

    pub fn last_attempt(&self) -> Option<&AttemptEvent> {
        self.attempts.last()
    }
}

/// `<host-and-path slug>-<unix millis>`.
pub fn record_id(url: &str, at: DateTime<Utc>) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let mut slug = String::with_capacity(without_scheme.len());
    for ch in without_scheme.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "prospect" } else { slug };
    format!("{slug}-{}", at.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn record_id_slugs_url_and_appends_millis() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            record_id("https://www.Acme.test/about/", at),
            "www-acme-test-about-1700000000123"
        );
        assert_eq!(record_id("://", at), "prospect-1700000000123");
    }

    #[test]
    fn stage_strings_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        for kind in AttemptKind::ALL {
            assert_eq!(kind.as_str().parse::<AttemptKind>().unwrap(), kind);
        }
    }

    #[test]
    fn new_record_starts_empty() {
        let record = OutreachRecord::new("https://acme.test", Utc::now());
        assert_eq!(record.stage, Stage::New);
        assert!(record.attempts.is_empty());
        assert!(record.failure().is_none());
        assert!(record.id.starts_with("acme-test-"));
    }

    #[test]
    fn abortable_stages() {
        assert!(Stage::New.is_abortable());
        assert!(Stage::AwaitingConfirmation.is_abortable());
        assert!(!Stage::Sent.is_abortable());
        assert!(!Stage::Failed.is_abortable());
    }
}
