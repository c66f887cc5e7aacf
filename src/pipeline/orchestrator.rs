//! Orchestrator: drives outreach records through the stage state machine.
//!
//! Every stage invocation runs the same loop: execute, then either commit
//! the success, or record the failure and consult the retry policy. Each
//! attempt is appended to the record's log before the stage changes, and
//! the stage is always the replay of that log.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::capabilities::{Analyzer, Dispatcher, Drafter, Fetcher, Tone};
use crate::error::OutreachError;
use crate::outreach::{
    AttemptEvent, AttemptKind, AttemptOutcome, Draft, FollowUpBuckets, Note, OutreachRecord,
    OutreachStats, Projection, Stage,
};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::executor::{
    AnalyzeExecutor, DraftExecutor, ScrapeExecutor, SendExecutor, StageExecutor,
};
use crate::pipeline::retry::{RetryAction, RetryPolicy, RetryState};
use crate::pipeline::types::{Classification, StageResult};
use crate::store::{RecordStore, TrackingUpdate};

/// How many consecutive millisecond ids `start` tries before giving up.
const ID_COLLISION_RETRIES: i64 = 16;

/// The four external collaborators.
#[derive(Clone)]
pub struct Capabilities {
    pub fetcher: Arc<dyn Fetcher>,
    pub analyzer: Arc<dyn Analyzer>,
    pub drafter: Arc<dyn Drafter>,
    pub dispatcher: Arc<dyn Dispatcher>,
}

/// Explicit orchestrator settings. Nothing here is read from the environment.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Tone used when a caller does not pick one.
    pub tone: Tone,
    pub retry: RetryPolicy,
    /// Deadline for a single capability call.
    pub call_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tone: Tone::default(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Result of one stage loop.
enum StageRun<T> {
    Completed(T),
    /// A failure was committed; the record did not advance.
    Stopped,
}

pub struct Orchestrator {
    store: Arc<dyn RecordStore>,
    caps: Capabilities,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RecordStore>, caps: Capabilities, config: OrchestratorConfig) -> Self {
        Self {
            store,
            caps,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ── Loading & committing ────────────────────────────────────────

    /// Load a record and check that its stored stage matches its log.
    pub async fn get(&self, id: &str) -> Result<OutreachRecord, OutreachError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| OutreachError::NotFound { id: id.to_string() })?;

        let projection = record.projection().map_err(|e| OutreachError::Corrupted {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        if projection.stage != record.stage {
            return Err(OutreachError::Corrupted {
                id: id.to_string(),
                reason: format!(
                    "stored stage {} but attempt log replays to {}",
                    record.stage, projection.stage
                ),
            });
        }
        Ok(record)
    }

    /// Tone for drafting `record`: the requested one, else its current
    /// draft's, else the configured default.
    pub fn tone_for(&self, record: &OutreachRecord, requested: Option<Tone>) -> Tone {
        requested
            .or_else(|| record.draft.as_ref().map(|d| d.tone))
            .unwrap_or(self.config.tone)
    }

    pub async fn list(&self, stage: Option<Stage>) -> Result<Vec<OutreachRecord>, OutreachError> {
        Ok(self.store.list(stage).await?)
    }

    fn projection(record: &OutreachRecord) -> Result<Projection, OutreachError> {
        record.projection().map_err(|e| OutreachError::Corrupted {
            id: record.id.clone(),
            reason: e.to_string(),
        })
    }

    /// Refuse `kind` up front if the record cannot accept it.
    fn ensure_accepts(record: &OutreachRecord, kind: AttemptKind) -> Result<(), OutreachError> {
        if Self::projection(record)?.accepts(kind) {
            Ok(())
        } else {
            Err(OutreachError::InvalidTransition {
                id: record.id.clone(),
                stage: record.stage.to_string(),
                action: kind.to_string(),
            })
        }
    }

    /// Append `event` to the log, move the stage, and persist both.
    async fn commit(
        &self,
        record: &mut OutreachRecord,
        mut event: AttemptEvent,
    ) -> Result<(), OutreachError> {
        let mut projection = Self::projection(record)?;
        projection
            .apply(&event)
            .map_err(|e| OutreachError::InvalidTransition {
                id: record.id.clone(),
                stage: e.stage.to_string(),
                action: e.kind.to_string(),
            })?;

        event.seq = u32::try_from(record.attempts.len() + 1).map_err(|_| {
            OutreachError::Corrupted {
                id: record.id.clone(),
                reason: "attempt log overflow".into(),
            }
        })?;
        record.attempts.push(event.clone());
        record.stage = projection.stage;
        record.updated_at = event.at;

        self.store.append_attempt(record, &event).await?;
        debug!(
            record_id = %record.id,
            seq = event.seq,
            kind = %event.kind,
            outcome = event.outcome.as_str(),
            stage = %record.stage,
            "Committed attempt"
        );
        Ok(())
    }

    /// Record a cancellation observed while `kind` was pending.
    ///
    /// A cancelled regeneration leaves the existing draft in place; anything
    /// else ends the record.
    async fn commit_cancel(
        &self,
        record: &mut OutreachRecord,
        kind: AttemptKind,
    ) -> Result<(), OutreachError> {
        let detail = format!("cancelled during {kind}");
        let event = if kind == AttemptKind::Regenerate {
            AttemptEvent::failure(
                kind,
                AttemptOutcome::FatalFailure,
                Classification::Cancelled,
                detail,
                false,
                Utc::now(),
            )
        } else {
            AttemptEvent::failure(
                AttemptKind::Abort,
                AttemptOutcome::FatalFailure,
                Classification::Cancelled,
                detail,
                true,
                Utc::now(),
            )
        };
        warn!(record_id = %record.id, %kind, "Run cancelled");
        self.commit(record, event).await
    }

    // ── Stage loop ──────────────────────────────────────────────────

    /// Invoke `executor` until it succeeds, the retry policy gives up, or
    /// the run is cancelled. Failures are committed here; a success is
    /// returned for the caller to attach its artifact and commit.
    async fn run_stage<E: StageExecutor>(
        &self,
        record: &mut OutreachRecord,
        executor: &E,
        kind: AttemptKind,
        cancel: &CancelToken,
    ) -> Result<StageRun<E::Output>, OutreachError> {
        let regenerating = kind == AttemptKind::Regenerate;
        let mut retry = RetryState::new(executor.stage());

        loop {
            if cancel.is_cancelled() {
                self.commit_cancel(record, kind).await?;
                return Ok(StageRun::Stopped);
            }

            let (classification, detail) = match executor.execute(record).await {
                StageResult::Success(output) => return Ok(StageRun::Completed(output)),
                StageResult::RetryableFailure {
                    classification,
                    detail,
                }
                | StageResult::FatalFailure {
                    classification,
                    detail,
                } => (classification, detail),
            };

            match retry.record_failure(&self.config.retry, classification) {
                RetryAction::Abort => {
                    warn!(
                        record_id = %record.id,
                        %kind,
                        %classification,
                        detail = %detail,
                        "Stage failed, giving up"
                    );
                    let event = AttemptEvent::failure(
                        kind,
                        AttemptOutcome::FatalFailure,
                        classification,
                        detail,
                        !regenerating,
                        Utc::now(),
                    );
                    self.commit(record, event).await?;
                    return Ok(StageRun::Stopped);
                }
                RetryAction::RetryAfter(delay) => {
                    info!(
                        record_id = %record.id,
                        %kind,
                        %classification,
                        delay_ms = delay.as_millis() as u64,
                        "Stage failed, retrying"
                    );
                    let event = AttemptEvent::failure(
                        kind,
                        AttemptOutcome::RetryableFailure,
                        classification,
                        detail,
                        false,
                        Utc::now(),
                    );
                    self.commit(record, event).await?;

                    if cancel.is_cancelled() || !retry.wait(cancel).await {
                        self.commit_cancel(record, kind).await?;
                        return Ok(StageRun::Stopped);
                    }
                }
            }
        }
    }

    async fn scrape(
        &self,
        record: &mut OutreachRecord,
        cancel: &CancelToken,
    ) -> Result<bool, OutreachError> {
        let executor = ScrapeExecutor::new(self.caps.fetcher.clone(), self.config.call_timeout);
        match self.run_stage(record, &executor, AttemptKind::Scrape, cancel).await? {
            StageRun::Completed(content) => {
                record.content = Some(content);
                self.commit(record, AttemptEvent::success(AttemptKind::Scrape, Utc::now()))
                    .await?;
                Ok(true)
            }
            StageRun::Stopped => Ok(false),
        }
    }

    async fn analyze(
        &self,
        record: &mut OutreachRecord,
        cancel: &CancelToken,
    ) -> Result<bool, OutreachError> {
        let executor = AnalyzeExecutor::new(self.caps.analyzer.clone(), self.config.call_timeout);
        match self.run_stage(record, &executor, AttemptKind::Analyze, cancel).await? {
            StageRun::Completed(analysis) => {
                record.analysis = Some(analysis);
                self.commit(record, AttemptEvent::success(AttemptKind::Analyze, Utc::now()))
                    .await?;
                Ok(true)
            }
            StageRun::Stopped => Ok(false),
        }
    }

    /// Draft or regenerate, depending on `kind`.
    async fn draft(
        &self,
        record: &mut OutreachRecord,
        tone: Tone,
        kind: AttemptKind,
        cancel: &CancelToken,
    ) -> Result<bool, OutreachError> {
        let executor = DraftExecutor::new(self.caps.drafter.clone(), tone, self.config.call_timeout);
        match self.run_stage(record, &executor, kind, cancel).await? {
            StageRun::Completed(email) => {
                let now = Utc::now();
                record.draft = Some(Draft {
                    subject: email.subject,
                    body: email.body,
                    tone: executor.tone(),
                    generated_at: now,
                });
                let event = AttemptEvent::success(kind, now).with_detail(format!("tone={tone}"));
                self.commit(record, event).await?;
                Ok(true)
            }
            StageRun::Stopped => Ok(false),
        }
    }

    // ── Pipeline commands ───────────────────────────────────────────

    /// Create a fresh record for `url`.
    ///
    /// Ids embed the creation millisecond; a collision moves to the next one.
    pub async fn start(
        &self,
        url: &str,
        recipient: Option<&str>,
    ) -> Result<OutreachRecord, OutreachError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(OutreachError::InvalidInput("url is empty".into()));
        }
        let recipient = recipient.map(str::trim).filter(|r| !r.is_empty());

        let mut at = Utc::now();
        for _ in 0..ID_COLLISION_RETRIES {
            let mut record = OutreachRecord::new(url, at);
            record.recipient = recipient.map(str::to_string);
            if self.store.create_if_absent(&record).await? {
                info!(record_id = %record.id, url = %record.url, "Record created");
                return Ok(record);
            }
            at += chrono::Duration::milliseconds(1);
        }
        Err(OutreachError::InvalidInput(format!(
            "could not allocate a record id for {url}"
        )))
    }

    /// Advance a record through scrape, analyze and draft, stopping at the
    /// first stage that fails or when the record is already past drafting.
    pub async fn drive(
        &self,
        id: &str,
        tone: Tone,
        cancel: &CancelToken,
    ) -> Result<OutreachRecord, OutreachError> {
        let mut record = self.get(id).await?;
        info!(record_id = %id, stage = %record.stage, %tone, "Driving record");

        loop {
            let advanced = match record.stage {
                Stage::New => self.scrape(&mut record, cancel).await?,
                Stage::Scraped => self.analyze(&mut record, cancel).await?,
                Stage::Analyzed => {
                    self.draft(&mut record, tone, AttemptKind::Draft, cancel)
                        .await?
                }
                _ => break,
            };
            if !advanced {
                break;
            }
        }

        info!(record_id = %id, stage = %record.stage, "Drive finished");
        Ok(record)
    }

    /// Create a record for `url` and drive it to `drafted`.
    pub async fn process(
        &self,
        url: &str,
        tone: Tone,
        cancel: &CancelToken,
    ) -> Result<OutreachRecord, OutreachError> {
        let record = self.start(url, None).await?;
        self.drive(&record.id, tone, cancel).await
    }

    /// Continue an interrupted record from wherever its log left it.
    pub async fn resume(
        &self,
        id: &str,
        tone: Tone,
        cancel: &CancelToken,
    ) -> Result<OutreachRecord, OutreachError> {
        self.drive(id, tone, cancel).await
    }

    /// Replace the current draft. The stage stays `drafted` and the
    /// analysis is left untouched, even if regeneration fails.
    pub async fn regenerate(
        &self,
        id: &str,
        tone: Tone,
        cancel: &CancelToken,
    ) -> Result<OutreachRecord, OutreachError> {
        let mut record = self.get(id).await?;
        Self::ensure_accepts(&record, AttemptKind::Regenerate)?;
        info!(record_id = %id, %tone, "Regenerating draft");
        self.draft(&mut record, tone, AttemptKind::Regenerate, cancel)
            .await?;
        Ok(record)
    }

    /// Replace the draft's subject and/or body by hand.
    ///
    /// The record goes back to `drafted`, so a send must be requested and
    /// confirmed again for the edited text.
    pub async fn edit_draft(
        &self,
        id: &str,
        subject: Option<&str>,
        body: Option<&str>,
    ) -> Result<OutreachRecord, OutreachError> {
        let subject = subject.map(str::trim);
        let body = body.map(str::trim);
        if subject.is_none() && body.is_none() {
            return Err(OutreachError::InvalidInput(
                "edit needs a subject or a body".into(),
            ));
        }
        if subject.is_some_and(str::is_empty) || body.is_some_and(str::is_empty) {
            return Err(OutreachError::InvalidInput("draft text is empty".into()));
        }

        let mut record = self.get(id).await?;
        Self::ensure_accepts(&record, AttemptKind::Edit)?;
        let Some(draft) = record.draft.as_mut() else {
            return Err(OutreachError::Corrupted {
                id: id.to_string(),
                reason: format!("stage {} has no draft", record.stage),
            });
        };

        let mut changed = Vec::new();
        if let Some(subject) = subject {
            draft.subject = subject.to_string();
            changed.push("subject");
        }
        if let Some(body) = body {
            draft.body = body.to_string();
            changed.push("body");
        }
        let event = AttemptEvent::success(AttemptKind::Edit, Utc::now()).with_detail(changed.join(","));
        self.commit(&mut record, event).await?;
        info!(record_id = %id, "Draft edited");
        Ok(record)
    }

    /// Move a drafted record to `awaiting_confirmation`.
    pub async fn request_send(&self, id: &str) -> Result<OutreachRecord, OutreachError> {
        let mut record = self.get(id).await?;
        Self::ensure_accepts(&record, AttemptKind::RequestSend)?;
        self.commit(&mut record, AttemptEvent::success(AttemptKind::RequestSend, Utc::now()))
            .await?;
        info!(record_id = %id, "Send requested, awaiting confirmation");
        Ok(record)
    }

    /// Confirm a pending send to `recipient` and dispatch it.
    pub async fn confirm_send(
        &self,
        id: &str,
        recipient: &str,
        cancel: &CancelToken,
    ) -> Result<OutreachRecord, OutreachError> {
        self.confirm_and_send(id, recipient, "confirmed", cancel).await
    }

    pub(crate) async fn confirm_and_send(
        &self,
        id: &str,
        recipient: &str,
        detail: &str,
        cancel: &CancelToken,
    ) -> Result<OutreachRecord, OutreachError> {
        let mut record = self.get(id).await?;
        Self::ensure_accepts(&record, AttemptKind::Confirm)?;

        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(OutreachError::InvalidInput("recipient is empty".into()));
        }
        record.recipient = Some(recipient.to_string());
        self.commit(
            &mut record,
            AttemptEvent::success(AttemptKind::Confirm, Utc::now()).with_detail(detail),
        )
        .await?;

        let executor = SendExecutor::new(self.caps.dispatcher.clone(), self.config.call_timeout);
        if let StageRun::Completed(receipt) = self
            .run_stage(&mut record, &executor, AttemptKind::Send, cancel)
            .await?
        {
            record.sent_at = Some(receipt.sent_at);
            let event = AttemptEvent::success(AttemptKind::Send, receipt.sent_at)
                .with_detail(receipt.message_id.clone());
            record.receipt = Some(receipt);
            self.commit(&mut record, event).await?;
            info!(record_id = %id, recipient = %recipient, "Outreach sent");
        }
        Ok(record)
    }

    /// Explicitly end a non-terminal record.
    pub async fn abort(&self, id: &str, reason: &str) -> Result<OutreachRecord, OutreachError> {
        self.abort_with(id, Classification::Cancelled, reason).await
    }

    pub async fn abort_with(
        &self,
        id: &str,
        classification: Classification,
        detail: &str,
    ) -> Result<OutreachRecord, OutreachError> {
        let mut record = self.get(id).await?;
        Self::ensure_accepts(&record, AttemptKind::Abort)?;
        let event = AttemptEvent::failure(
            AttemptKind::Abort,
            AttemptOutcome::FatalFailure,
            classification,
            detail,
            true,
            Utc::now(),
        );
        self.commit(&mut record, event).await?;
        warn!(record_id = %id, %classification, "Record aborted");
        Ok(record)
    }

    // ── Tracking commands ───────────────────────────────────────────

    /// Assert the message was opened. Repeats only move the timestamp.
    pub async fn mark_opened(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<OutreachRecord, OutreachError> {
        let mut record = self.get(id).await?;
        Self::ensure_accepts(&record, AttemptKind::MarkOpened)?;

        if record.tracking.opened_at.is_some() {
            self.store
                .update_tracking(id, TrackingUpdate::Opened(at))
                .await?;
            record.tracking.opened_at = Some(at);
        } else {
            record.tracking.opened_at = Some(at);
            self.commit(&mut record, AttemptEvent::success(AttemptKind::MarkOpened, at))
                .await?;
        }
        info!(record_id = %id, stage = %record.stage, "Marked opened");
        Ok(record)
    }

    /// Assert a reply arrived. Repeats only move the timestamp.
    pub async fn mark_replied(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<OutreachRecord, OutreachError> {
        let mut record = self.get(id).await?;
        Self::ensure_accepts(&record, AttemptKind::MarkReplied)?;

        if record.tracking.replied_at.is_some() {
            self.store
                .update_tracking(id, TrackingUpdate::Replied(at))
                .await?;
            record.tracking.replied_at = Some(at);
        } else {
            record.tracking.replied_at = Some(at);
            self.commit(&mut record, AttemptEvent::success(AttemptKind::MarkReplied, at))
                .await?;
        }
        info!(record_id = %id, stage = %record.stage, "Marked replied");
        Ok(record)
    }

    /// Set the follow-up due date. Only delivered records are followed up.
    pub async fn schedule_follow_up(
        &self,
        id: &str,
        due: DateTime<Utc>,
    ) -> Result<OutreachRecord, OutreachError> {
        let mut record = self.get(id).await?;
        if !record.stage.is_delivered() {
            return Err(OutreachError::InvalidTransition {
                id: id.to_string(),
                stage: record.stage.to_string(),
                action: "schedule follow-up".into(),
            });
        }
        self.store
            .update_tracking(id, TrackingUpdate::FollowUpDue(Some(due)))
            .await?;
        record.tracking.follow_up_due_at = Some(due);
        info!(record_id = %id, due = %due, "Follow-up scheduled");
        Ok(record)
    }

    pub async fn clear_follow_up(&self, id: &str) -> Result<OutreachRecord, OutreachError> {
        let mut record = self.get(id).await?;
        self.store
            .update_tracking(id, TrackingUpdate::FollowUpDue(None))
            .await?;
        record.tracking.follow_up_due_at = None;
        Ok(record)
    }

    /// Push the follow-up `days` past the later of now and the current due date.
    pub async fn snooze_follow_up(
        &self,
        id: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<OutreachRecord, OutreachError> {
        if days <= 0 {
            return Err(OutreachError::InvalidInput(format!(
                "snooze days must be positive, got {days}"
            )));
        }
        let record = self.get(id).await?;
        let from = record
            .tracking
            .follow_up_due_at
            .map_or(now, |due| due.max(now));
        self.schedule_follow_up(id, from + chrono::Duration::days(days))
            .await
    }

    pub async fn add_note(&self, id: &str, text: &str) -> Result<OutreachRecord, OutreachError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(OutreachError::InvalidInput("note is empty".into()));
        }
        let mut record = self.get(id).await?;
        let note = Note {
            at: Utc::now(),
            text: text.to_string(),
        };
        self.store
            .update_tracking(id, TrackingUpdate::Note(note.clone()))
            .await?;
        record.tracking.notes.push(note);
        Ok(record)
    }

    pub async fn follow_up_dashboard(
        &self,
        now: DateTime<Utc>,
    ) -> Result<FollowUpBuckets, OutreachError> {
        let records = self.store.list(None).await?;
        Ok(FollowUpBuckets::from_records(records, now))
    }

    pub async fn follow_ups_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutreachRecord>, OutreachError> {
        Ok(self.store.follow_ups_due(now).await?)
    }

    pub async fn outreach_stats(&self, now: DateTime<Utc>) -> Result<OutreachStats, OutreachError> {
        let records = self.store.list(None).await?;
        Ok(OutreachStats::from_records(&records, now))
    }
}
