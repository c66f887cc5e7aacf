//! Record state machine.
//!
//! A single transition table drives both live commits and replay, so the
//! stored stage can always be recomputed from the attempt log.

use serde::{Deserialize, Serialize};

use crate::outreach::model::{AttemptEvent, AttemptKind, AttemptOutcome, Stage};
use crate::pipeline::types::{Classification, StageKind};

/// Where a failed record stopped and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub step: StageKind,
    pub classification: Classification,
    pub detail: Option<String>,
}

/// An event the current state does not accept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} ({outcome}) is not valid from {stage}")]
pub struct TransitionError {
    pub stage: Stage,
    pub kind: AttemptKind,
    pub outcome: &'static str,
}

/// State derived from the attempt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub stage: Stage,
    /// An explicit send confirmation is pending for the current draft.
    pub confirmed: bool,
    pub failure: Option<FailureReport>,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            stage: Stage::New,
            confirmed: false,
            failure: None,
        }
    }
}

impl Projection {
    /// Fold an entire log from the initial state.
    pub fn replay(events: &[AttemptEvent]) -> Result<Self, TransitionError> {
        let mut projection = Self::default();
        for event in events {
            projection.apply(event)?;
        }
        Ok(projection)
    }

    /// Whether `kind` may be attempted from the current state.
    pub fn accepts(&self, kind: AttemptKind) -> bool {
        use Stage::*;

        match kind {
            AttemptKind::Scrape => self.stage == New,
            AttemptKind::Analyze => self.stage == Scraped,
            AttemptKind::Draft => self.stage == Analyzed,
            AttemptKind::Regenerate | AttemptKind::Edit => {
                matches!(self.stage, Drafted | AwaitingConfirmation)
            }
            AttemptKind::RequestSend => self.stage == Drafted,
            AttemptKind::Confirm => self.stage == AwaitingConfirmation,
            AttemptKind::Send => self.stage == AwaitingConfirmation && self.confirmed,
            AttemptKind::MarkOpened => matches!(self.stage, Sent | Opened | Replied),
            AttemptKind::MarkReplied => matches!(self.stage, Sent | Opened | Replied),
            AttemptKind::Abort => self.stage.is_abortable(),
        }
    }

    /// Apply one event, or reject it without changing state.
    pub fn apply(&mut self, event: &AttemptEvent) -> Result<(), TransitionError> {
        let stage = self.stage;
        let reject = move || TransitionError {
            stage,
            kind: event.kind,
            outcome: event.outcome.as_str(),
        };

        if !self.accepts(event.kind) {
            return Err(reject());
        }

        if event.outcome != AttemptOutcome::Success {
            // Regeneration never ends a record; the previous draft stands.
            if event.terminal && event.kind == AttemptKind::Regenerate {
                return Err(reject());
            }
            // Aborts are always terminal.
            if event.kind == AttemptKind::Abort {
                if !event.terminal {
                    return Err(reject());
                }
            } else if !matches!(
                event.kind,
                AttemptKind::Scrape
                    | AttemptKind::Analyze
                    | AttemptKind::Draft
                    | AttemptKind::Regenerate
                    | AttemptKind::Send
            ) {
                return Err(reject());
            }

            if event.terminal {
                let step = event
                    .kind
                    .stage_kind()
                    .or_else(|| self.stage.pending_step())
                    .unwrap_or(StageKind::Scrape);
                self.failure = Some(FailureReport {
                    step,
                    classification: event.classification.unwrap_or(Classification::Unknown),
                    detail: event.detail.clone(),
                });
                self.stage = Stage::Failed;
                self.confirmed = false;
            }
            return Ok(());
        }

        match event.kind {
            AttemptKind::Scrape => self.stage = Stage::Scraped,
            AttemptKind::Analyze => self.stage = Stage::Analyzed,
            AttemptKind::Draft | AttemptKind::Regenerate | AttemptKind::Edit => {
                self.stage = Stage::Drafted;
                self.confirmed = false;
            }
            AttemptKind::RequestSend => {
                self.stage = Stage::AwaitingConfirmation;
                self.confirmed = false;
            }
            AttemptKind::Confirm => self.confirmed = true,
            AttemptKind::Send => {
                self.stage = Stage::Sent;
                self.confirmed = false;
            }
            AttemptKind::MarkOpened => {
                if self.stage == Stage::Sent {
                    self.stage = Stage::Opened;
                }
            }
            AttemptKind::MarkReplied => self.stage = Stage::Replied,
            AttemptKind::Abort => return Err(reject()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ok(kind: AttemptKind) -> AttemptEvent {
        AttemptEvent::success(kind, Utc::now())
    }

    fn fail(kind: AttemptKind, c: Classification, terminal: bool) -> AttemptEvent {
        let outcome = if terminal {
            AttemptOutcome::FatalFailure
        } else {
            AttemptOutcome::RetryableFailure
        };
        AttemptEvent::failure(kind, outcome, c, "boom", terminal, Utc::now())
    }

    fn drafted() -> Vec<AttemptEvent> {
        vec![
            ok(AttemptKind::Scrape),
            ok(AttemptKind::Analyze),
            ok(AttemptKind::Draft),
        ]
    }

    #[test]
    fn happy_path_replays_to_replied() {
        let mut log = drafted();
        log.extend([
            ok(AttemptKind::RequestSend),
            ok(AttemptKind::Confirm),
            ok(AttemptKind::Send),
            ok(AttemptKind::MarkOpened),
            ok(AttemptKind::MarkReplied),
        ]);
        let p = Projection::replay(&log).unwrap();
        assert_eq!(p.stage, Stage::Replied);
        assert!(p.failure.is_none());
    }

    #[test]
    fn retryable_failures_do_not_move_stage() {
        let log = vec![
            fail(AttemptKind::Scrape, Classification::TransientNetwork, false),
            fail(AttemptKind::Scrape, Classification::TransientNetwork, false),
            ok(AttemptKind::Scrape),
        ];
        assert_eq!(Projection::replay(&log).unwrap().stage, Stage::Scraped);
    }

    #[test]
    fn terminal_failure_records_step_and_classification() {
        let log = vec![
            ok(AttemptKind::Scrape),
            fail(AttemptKind::Analyze, Classification::RateLimited, true),
        ];
        let p = Projection::replay(&log).unwrap();
        assert_eq!(p.stage, Stage::Failed);
        let failure = p.failure.unwrap();
        assert_eq!(failure.step, StageKind::Analyze);
        assert_eq!(failure.classification, Classification::RateLimited);
    }

    #[test]
    fn nothing_is_accepted_after_failure() {
        let mut p = Projection::replay(&[fail(
            AttemptKind::Scrape,
            Classification::InvalidInput,
            true,
        )])
        .unwrap();
        assert!(p.apply(&ok(AttemptKind::Scrape)).is_err());
        assert!(p.apply(&fail(AttemptKind::Abort, Classification::Cancelled, true)).is_err());
        assert_eq!(p.stage, Stage::Failed);
    }

    #[test]
    fn send_requires_request_and_confirmation() {
        let mut p = Projection::replay(&drafted()).unwrap();
        assert!(p.apply(&ok(AttemptKind::Send)).is_err());
        assert!(p.apply(&ok(AttemptKind::Confirm)).is_err());

        p.apply(&ok(AttemptKind::RequestSend)).unwrap();
        assert!(p.apply(&ok(AttemptKind::Send)).is_err());

        p.apply(&ok(AttemptKind::Confirm)).unwrap();
        p.apply(&ok(AttemptKind::Send)).unwrap();
        assert_eq!(p.stage, Stage::Sent);
    }

    #[test]
    fn regenerate_keeps_drafted_and_clears_confirmation() {
        let mut log = drafted();
        log.extend([ok(AttemptKind::RequestSend), ok(AttemptKind::Confirm)]);
        let mut p = Projection::replay(&log).unwrap();
        assert!(p.confirmed);

        p.apply(&ok(AttemptKind::Regenerate)).unwrap();
        assert_eq!(p.stage, Stage::Drafted);
        assert!(!p.confirmed);

        p.apply(&fail(AttemptKind::Regenerate, Classification::RateLimited, false))
            .unwrap();
        assert_eq!(p.stage, Stage::Drafted);
        assert!(
            p.apply(&fail(AttemptKind::Regenerate, Classification::Unknown, true))
                .is_err()
        );
    }

    #[test]
    fn edit_returns_to_drafted_and_needs_new_confirmation() {
        let mut log = drafted();
        log.extend([ok(AttemptKind::RequestSend), ok(AttemptKind::Confirm)]);
        let mut p = Projection::replay(&log).unwrap();

        p.apply(&ok(AttemptKind::Edit)).unwrap();
        assert_eq!(p.stage, Stage::Drafted);
        assert!(!p.confirmed);
        assert!(p.apply(&ok(AttemptKind::Send)).is_err());
        assert!(
            p.apply(&fail(AttemptKind::Edit, Classification::Unknown, false))
                .is_err()
        );

        let mut early = Projection::replay(&drafted()[..2]).unwrap();
        assert!(early.apply(&ok(AttemptKind::Edit)).is_err());
    }

    #[test]
    fn marks_are_order_independent() {
        let mut log = drafted();
        log.extend([
            ok(AttemptKind::RequestSend),
            ok(AttemptKind::Confirm),
            ok(AttemptKind::Send),
            ok(AttemptKind::MarkReplied),
            ok(AttemptKind::MarkOpened),
        ]);
        assert_eq!(Projection::replay(&log).unwrap().stage, Stage::Replied);
    }

    #[test]
    fn marks_rejected_before_send() {
        let mut p = Projection::replay(&drafted()).unwrap();
        assert!(p.apply(&ok(AttemptKind::MarkOpened)).is_err());
        assert!(p.apply(&ok(AttemptKind::MarkReplied)).is_err());
    }

    #[test]
    fn abort_from_awaiting_reports_send_step() {
        let mut log = drafted();
        log.push(ok(AttemptKind::RequestSend));
        log.push(fail(AttemptKind::Abort, Classification::Cancelled, true));
        let p = Projection::replay(&log).unwrap();
        assert_eq!(p.stage, Stage::Failed);
        assert_eq!(p.failure.unwrap().step, StageKind::Send);
    }

    #[test]
    fn abort_rejected_after_send() {
        let mut log = drafted();
        log.extend([
            ok(AttemptKind::RequestSend),
            ok(AttemptKind::Confirm),
            ok(AttemptKind::Send),
        ]);
        let mut p = Projection::replay(&log).unwrap();
        assert!(p.apply(&fail(AttemptKind::Abort, Classification::Cancelled, true)).is_err());
    }
}
