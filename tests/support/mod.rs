//! Scripted capabilities and an in-memory orchestrator for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use outreach_agent::capabilities::{
    Analysis, Analyzer, Dispatcher, Drafter, EmailDraft, Fetcher, PageContent, SendReceipt, Tone,
};
use outreach_agent::error::{AnalyzeError, DraftError, FetchError, SendError};
use outreach_agent::pipeline::{
    CancelToken, Capabilities, Orchestrator, OrchestratorConfig, RetryPolicy,
};
use outreach_agent::store::{LibSqlBackend, RecordStore};

/// Key used by capabilities whose script is not per-URL.
pub const ANY: &str = "*";

/// Queued results per key, falling back to a default when a queue is empty.
pub struct Script<T, E> {
    queued: Mutex<HashMap<String, VecDeque<Result<T, E>>>>,
    calls: AtomicUsize,
}

impl<T, E> Default for Script<T, E> {
    fn default() -> Self {
        Self {
            queued: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl<T, E> Script<T, E> {
    pub fn push(&self, key: &str, result: Result<T, E>) {
        self.queued
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(result);
    }

    fn next(&self, key: &str) -> Option<Result<T, E>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queued
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

// ── Fetcher ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeFetcher {
    pub script: Script<PageContent, FetchError>,
    panic_on: Mutex<HashSet<String>>,
    cancel_on: Mutex<HashMap<String, CancelToken>>,
}

impl FakeFetcher {
    pub fn panic_on(&self, url: &str) {
        self.panic_on.lock().unwrap().insert(url.to_string());
    }

    /// Fire `cancel` while the fetch of `url` is in flight.
    pub fn cancel_during(&self, url: &str, cancel: &CancelToken) {
        self.cancel_on
            .lock()
            .unwrap()
            .insert(url.to_string(), cancel.clone());
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<PageContent, FetchError> {
        let explode = self.panic_on.lock().unwrap().contains(url);
        if explode {
            panic!("fetcher exploded on {url}");
        }
        let cancel = self.cancel_on.lock().unwrap().remove(url);
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.script.next(url).unwrap_or_else(|| {
            Ok(PageContent::single(
                url,
                format!("{url} builds custom widgets for logistics companies."),
            ))
        })
    }
}

// ── Analyzer ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeAnalyzer {
    /// Keyed by the first page's URL.
    pub script: Script<Analysis, AnalyzeError>,
}

pub fn analysis_for(url: &str) -> Analysis {
    Analysis {
        company_name: url.trim_start_matches("https://").to_string(),
        summary: "Builds custom widgets.".into(),
        industry: "Logistics".into(),
        services: ["widgets".to_string()].into_iter().collect(),
        pain_points: vec!["manual dispatch".into()],
        opportunities: vec!["route automation".into()],
        value_proposition: "Automate dispatch.".into(),
        outreach_angle: "Their dispatch is still manual.".into(),
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze(&self, content: &PageContent) -> Result<Analysis, AnalyzeError> {
        let url = content
            .pages
            .first()
            .map(|p| p.page_url.clone())
            .unwrap_or_default();
        self.script
            .next(&url)
            .unwrap_or_else(|| Ok(analysis_for(&url)))
    }
}

// ── Drafter ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDrafter {
    pub script: Script<EmailDraft, DraftError>,
}

#[async_trait]
impl Drafter for FakeDrafter {
    async fn draft(&self, analysis: &Analysis, tone: Tone) -> Result<EmailDraft, DraftError> {
        let n = self.script.calls() + 1;
        self.script.next(ANY).unwrap_or_else(|| {
            Ok(EmailDraft {
                subject: format!("Idea for {} #{n}", analysis.company_name),
                body: format!("A {tone} note about {}.", analysis.outreach_angle),
            })
        })
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDispatcher {
    pub script: Script<SendReceipt, SendError>,
    /// Every draft handed to `send`, in call order.
    pub sent: Mutex<Vec<EmailDraft>>,
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn send(&self, draft: &EmailDraft, recipient: &str) -> Result<SendReceipt, SendError> {
        self.sent.lock().unwrap().push(draft.clone());
        let n = self.script.calls() + 1;
        self.script.next(ANY).unwrap_or_else(|| {
            Ok(SendReceipt {
                message_id: format!("<msg-{n}@test>"),
                recipient: recipient.to_string(),
                sent_at: Utc::now(),
            })
        })
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// Millisecond backoff so retry paths run instantly.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::uniform(3, Duration::from_millis(1), Duration::from_millis(5))
}

pub struct Harness {
    pub fetcher: Arc<FakeFetcher>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub drafter: Arc<FakeDrafter>,
    pub dispatcher: Arc<FakeDispatcher>,
    pub store: Arc<LibSqlBackend>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(fast_retry(), None).await
    }

    pub async fn with_retry(retry: RetryPolicy) -> Self {
        Self::build(retry, None).await
    }

    /// Use `dispatcher` instead of the scripted one.
    pub async fn with_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::build(fast_retry(), Some(dispatcher)).await
    }

    async fn build(retry: RetryPolicy, dispatcher: Option<Arc<dyn Dispatcher>>) -> Self {
        let fetcher = Arc::new(FakeFetcher::default());
        let analyzer = Arc::new(FakeAnalyzer::default());
        let drafter = Arc::new(FakeDrafter::default());
        let scripted_dispatcher = Arc::new(FakeDispatcher::default());
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());

        let caps = Capabilities {
            fetcher: fetcher.clone(),
            analyzer: analyzer.clone(),
            drafter: drafter.clone(),
            dispatcher: dispatcher.unwrap_or_else(|| scripted_dispatcher.clone() as Arc<dyn Dispatcher>),
        };
        let config = OrchestratorConfig {
            retry,
            call_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone() as Arc<dyn RecordStore>,
            caps,
            config,
        ));

        Self {
            fetcher,
            analyzer,
            drafter,
            dispatcher: scripted_dispatcher,
            store,
            orchestrator,
        }
    }
}
