//! Stage executors.
//!
//! Each executor performs exactly one capability call for a record and maps
//! the outcome onto a [`StageResult`]. Executors never touch the store and
//! never retry; both are the orchestrator's job.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::capabilities::{
    Analysis, Analyzer, Dispatcher, Drafter, EmailDraft, Fetcher, PageContent, SendReceipt, Tone,
};
use crate::outreach::OutreachRecord;
use crate::pipeline::types::{Classification, StageKind, StageResult};

/// One pipeline stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    type Output: Send;

    fn stage(&self) -> StageKind;

    /// Run the stage once against `record`'s current artifacts.
    async fn execute(&self, record: &OutreachRecord) -> StageResult<Self::Output>;
}

/// Run one capability call under a deadline and classify the result.
///
/// A call that outlives `timeout` is reported as `transient_network`.
async fn guarded<T, E, F>(
    stage: StageKind,
    timeout: Duration,
    call: F,
    classify: impl FnOnce(&E) -> Classification,
) -> StageResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => StageResult::Success(value),
        Ok(Err(e)) => {
            let classification = classify(&e);
            debug!(%stage, %classification, error = %e, "Stage call failed");
            StageResult::failure(stage, classification, e.to_string())
        }
        Err(_) => StageResult::failure(
            stage,
            Classification::TransientNetwork,
            format!("{stage} timed out after {}s", timeout.as_secs_f64()),
        ),
    }
}

fn missing<T>(stage: StageKind, what: &str) -> StageResult<T> {
    StageResult::FatalFailure {
        classification: Classification::InvalidInput,
        detail: format!("{stage} requires {what}"),
    }
}

// ── Scrape ──────────────────────────────────────────────────────────

pub struct ScrapeExecutor {
    fetcher: Arc<dyn Fetcher>,
    timeout: Duration,
}

impl ScrapeExecutor {
    pub fn new(fetcher: Arc<dyn Fetcher>, timeout: Duration) -> Self {
        Self { fetcher, timeout }
    }
}

#[async_trait]
impl StageExecutor for ScrapeExecutor {
    type Output = PageContent;

    fn stage(&self) -> StageKind {
        StageKind::Scrape
    }

    async fn execute(&self, record: &OutreachRecord) -> StageResult<PageContent> {
        if record.url.trim().is_empty() {
            return missing(self.stage(), "a url");
        }
        match guarded(
            self.stage(),
            self.timeout,
            self.fetcher.fetch(&record.url),
            |e| e.classification(),
        )
        .await
        {
            StageResult::Success(content) if content.is_empty() => StageResult::FatalFailure {
                classification: Classification::InvalidInput,
                detail: format!("no readable content at {}", record.url),
            },
            other => other,
        }
    }
}

// ── Analyze ─────────────────────────────────────────────────────────

pub struct AnalyzeExecutor {
    analyzer: Arc<dyn Analyzer>,
    timeout: Duration,
}

impl AnalyzeExecutor {
    pub fn new(analyzer: Arc<dyn Analyzer>, timeout: Duration) -> Self {
        Self { analyzer, timeout }
    }
}

#[async_trait]
impl StageExecutor for AnalyzeExecutor {
    type Output = Analysis;

    fn stage(&self) -> StageKind {
        StageKind::Analyze
    }

    async fn execute(&self, record: &OutreachRecord) -> StageResult<Analysis> {
        let Some(content) = record.content.as_ref() else {
            return missing(self.stage(), "scraped content");
        };
        guarded(
            self.stage(),
            self.timeout,
            self.analyzer.analyze(content),
            |e| e.classification(),
        )
        .await
    }
}

// ── Draft ───────────────────────────────────────────────────────────

pub struct DraftExecutor {
    drafter: Arc<dyn Drafter>,
    tone: Tone,
    timeout: Duration,
}

impl DraftExecutor {
    pub fn new(drafter: Arc<dyn Drafter>, tone: Tone, timeout: Duration) -> Self {
        Self {
            drafter,
            tone,
            timeout,
        }
    }

    pub fn tone(&self) -> Tone {
        self.tone
    }
}

#[async_trait]
impl StageExecutor for DraftExecutor {
    type Output = EmailDraft;

    fn stage(&self) -> StageKind {
        StageKind::Draft
    }

    async fn execute(&self, record: &OutreachRecord) -> StageResult<EmailDraft> {
        let Some(analysis) = record.analysis.as_ref() else {
            return missing(self.stage(), "an analysis");
        };
        guarded(
            self.stage(),
            self.timeout,
            self.drafter.draft(analysis, self.tone),
            |e| e.classification(),
        )
        .await
    }
}

// ── Send ────────────────────────────────────────────────────────────

pub struct SendExecutor {
    dispatcher: Arc<dyn Dispatcher>,
    timeout: Duration,
}

impl SendExecutor {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, timeout: Duration) -> Self {
        Self {
            dispatcher,
            timeout,
        }
    }
}

#[async_trait]
impl StageExecutor for SendExecutor {
    type Output = SendReceipt;

    fn stage(&self) -> StageKind {
        StageKind::Send
    }

    async fn execute(&self, record: &OutreachRecord) -> StageResult<SendReceipt> {
        let Some(draft) = record.draft.as_ref() else {
            return missing(self.stage(), "a draft");
        };
        let Some(recipient) = record.recipient.as_deref().filter(|r| !r.trim().is_empty()) else {
            return missing(self.stage(), "a recipient");
        };
        let email = EmailDraft {
            subject: draft.subject.clone(),
            body: draft.body.clone(),
        };
        guarded(
            self.stage(),
            self.timeout,
            self.dispatcher.send(&email, recipient),
            |e| e.classification(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AnalyzeError, FetchError};
    use chrono::Utc;

    struct SlowFetcher;

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch(&self, _url: &str) -> Result<PageContent, FetchError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(PageContent::single("https://slow.test", "late"))
        }
    }

    struct EmptyFetcher;

    #[async_trait]
    impl Fetcher for EmptyFetcher {
        async fn fetch(&self, _url: &str) -> Result<PageContent, FetchError> {
            Ok(PageContent::default())
        }
    }

    struct BrokenAnalyzer;

    #[async_trait]
    impl Analyzer for BrokenAnalyzer {
        async fn analyze(&self, _content: &PageContent) -> Result<Analysis, AnalyzeError> {
            Err(AnalyzeError::MalformedResponse("not json".into()))
        }
    }

    fn record() -> OutreachRecord {
        OutreachRecord::new("https://acme.test", Utc::now())
    }

    #[tokio::test]
    async fn timeout_is_transient_network() {
        let exec = ScrapeExecutor::new(Arc::new(SlowFetcher), Duration::from_millis(10));
        let result = exec.execute(&record()).await;
        assert!(matches!(
            result,
            StageResult::RetryableFailure {
                classification: Classification::TransientNetwork,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_content_is_invalid_input() {
        let exec = ScrapeExecutor::new(Arc::new(EmptyFetcher), Duration::from_secs(1));
        let result = exec.execute(&record()).await;
        assert_eq!(result.classification(), Some(Classification::InvalidInput));
        assert!(matches!(result, StageResult::FatalFailure { .. }));
    }

    #[tokio::test]
    async fn analyze_without_content_is_fatal() {
        let exec = AnalyzeExecutor::new(Arc::new(BrokenAnalyzer), Duration::from_secs(1));
        let result = exec.execute(&record()).await;
        assert!(matches!(
            result,
            StageResult::FatalFailure {
                classification: Classification::InvalidInput,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn malformed_analysis_is_retryable() {
        let exec = AnalyzeExecutor::new(Arc::new(BrokenAnalyzer), Duration::from_secs(1));
        let mut rec = record();
        rec.content = Some(PageContent::single("https://acme.test", "We make widgets."));
        let result = exec.execute(&rec).await;
        assert!(matches!(
            result,
            StageResult::RetryableFailure {
                classification: Classification::MalformedResponse,
                ..
            }
        ));
    }
}
