//! Batch runner: processes many prospects sequentially with per-record isolation.
//!
//! Each prospect runs in its own task so that an error or panic is caught
//! at the batch boundary, recorded against that prospect's record, and the
//! batch moves on to the next one.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::capabilities::{Tone, normalize_url};
use crate::error::OutreachError;
use crate::outreach::Stage;
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::types::{Classification, StageKind};

/// One input line: a URL and, optionally, who to send to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prospect {
    pub url: String,
    pub recipient: Option<String>,
}

impl Prospect {
    pub fn new(url: &str) -> Self {
        Self {
            url: normalize_url(url),
            recipient: None,
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }
}

impl FromStr for Prospect {
    type Err = String;

    /// Parses `url` or `url,recipient`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (url, recipient) = match s.split_once(',') {
            Some((url, recipient)) => (url.trim(), Some(recipient.trim())),
            None => (s.trim(), None),
        };
        if url.is_empty() {
            return Err(format!("missing url in '{s}'"));
        }
        let prospect = Self::new(url);
        Ok(match recipient.filter(|r| !r.is_empty()) {
            Some(r) => prospect.with_recipient(r),
            None => prospect,
        })
    }
}

/// Settings for one batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchConfig {
    pub tone: Tone,
    /// Send each draft right away when the prospect has a recipient.
    pub auto_send: bool,
}

/// How one prospect ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Succeeded {
        stage: Stage,
    },
    Failed {
        step: StageKind,
        classification: Classification,
        detail: Option<String>,
    },
    /// Never started because the run was cancelled first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchEntry {
    pub url: String,
    pub record_id: Option<String>,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
}

/// Counts per outcome plus one entry per input, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed_at_scrape: usize,
    pub failed_at_analyze: usize,
    pub failed_at_draft: usize,
    pub failed_at_send: usize,
    pub skipped: usize,
    pub entries: Vec<BatchEntry>,
}

impl BatchSummary {
    fn push(&mut self, entry: BatchEntry) {
        self.total += 1;
        match &entry.outcome {
            EntryOutcome::Succeeded { .. } => self.succeeded += 1,
            EntryOutcome::Failed { step, .. } => match step {
                StageKind::Scrape => self.failed_at_scrape += 1,
                StageKind::Analyze => self.failed_at_analyze += 1,
                StageKind::Draft => self.failed_at_draft += 1,
                StageKind::Send => self.failed_at_send += 1,
            },
            EntryOutcome::Skipped => self.skipped += 1,
        }
        self.entries.push(entry);
    }

    pub fn failed(&self) -> usize {
        self.failed_at_scrape + self.failed_at_analyze + self.failed_at_draft + self.failed_at_send
    }

    /// True when every prospect reached its target stage.
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }

    pub fn record_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| e.record_id.as_deref())
    }
}

pub struct BatchRunner {
    orchestrator: Arc<Orchestrator>,
}

impl BatchRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Process `prospects` in order. Never fails as a whole.
    pub async fn run_batch(
        &self,
        prospects: Vec<Prospect>,
        config: &BatchConfig,
        cancel: &CancelToken,
    ) -> BatchSummary {
        info!(
            count = prospects.len(),
            tone = %config.tone,
            auto_send = config.auto_send,
            "Starting batch"
        );

        let mut summary = BatchSummary::default();
        for prospect in prospects {
            if cancel.is_cancelled() {
                summary.push(BatchEntry {
                    url: prospect.url,
                    record_id: None,
                    outcome: EntryOutcome::Skipped,
                });
                continue;
            }
            let entry = self.run_one(prospect, config, cancel).await;
            summary.push(entry);
        }

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed(),
            skipped = summary.skipped,
            "Batch finished"
        );
        summary
    }

    async fn run_one(
        &self,
        prospect: Prospect,
        config: &BatchConfig,
        cancel: &CancelToken,
    ) -> BatchEntry {
        let record = match self
            .orchestrator
            .start(&prospect.url, prospect.recipient.as_deref())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!(url = %prospect.url, error = %e, "Could not create record");
                let classification = match &e {
                    OutreachError::InvalidInput(_) => Classification::InvalidInput,
                    _ => Classification::Unknown,
                };
                return BatchEntry {
                    url: prospect.url,
                    record_id: None,
                    outcome: EntryOutcome::Failed {
                        step: StageKind::Scrape,
                        classification,
                        detail: Some(e.to_string()),
                    },
                };
            }
        };

        let id = record.id.clone();
        let task = {
            let orchestrator = Arc::clone(&self.orchestrator);
            let id = id.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { advance(&orchestrator, &id, &config, &cancel).await })
        };

        let crashed = match task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) if e.is_panic() => Some("record task panicked".to_string()),
            Err(e) => Some(format!("record task did not finish: {e}")),
        };
        if let Some(detail) = crashed {
            error!(record_id = %id, detail = %detail, "Record failed outside its stages");
            if let Err(e) = self
                .orchestrator
                .abort_with(&id, Classification::Unknown, &detail)
                .await
            {
                warn!(record_id = %id, error = %e, "Could not record failure");
            }
        }

        self.entry_for(prospect.url, id).await
    }

    /// Summarize a finished record from its stored state.
    async fn entry_for(&self, url: String, id: String) -> BatchEntry {
        let outcome = match self.orchestrator.store().get(&id).await {
            Ok(Some(record)) => match record.failure() {
                Some(failure) => EntryOutcome::Failed {
                    step: failure.step,
                    classification: failure.classification,
                    detail: failure.detail,
                },
                None if record.stage == Stage::Failed => EntryOutcome::Failed {
                    step: StageKind::Scrape,
                    classification: Classification::Unknown,
                    detail: None,
                },
                None => EntryOutcome::Succeeded {
                    stage: record.stage,
                },
            },
            Ok(None) => EntryOutcome::Failed {
                step: StageKind::Scrape,
                classification: Classification::Unknown,
                detail: Some("record disappeared".into()),
            },
            Err(e) => EntryOutcome::Failed {
                step: StageKind::Scrape,
                classification: Classification::Unknown,
                detail: Some(e.to_string()),
            },
        };
        BatchEntry {
            url,
            record_id: Some(id),
            outcome,
        }
    }
}

/// Drive one record to `drafted`, then on to `sent` if auto-send applies.
async fn advance(
    orchestrator: &Orchestrator,
    id: &str,
    config: &BatchConfig,
    cancel: &CancelToken,
) -> Result<(), OutreachError> {
    let record = orchestrator.drive(id, config.tone, cancel).await?;
    if !config.auto_send || record.stage != Stage::Drafted {
        return Ok(());
    }
    let Some(recipient) = record.recipient else {
        info!(record_id = %id, "No recipient, leaving draft for review");
        return Ok(());
    };
    orchestrator.request_send(id).await?;
    orchestrator
        .confirm_and_send(id, &recipient, "auto_send", cancel)
        .await?;
    Ok(())
}
