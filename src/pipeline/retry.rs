//! Retry policy and the explicit retry state carried across waits.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::pipeline::cancel::CancelToken;
use crate::pipeline::types::{Classification, StageKind};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Abort,
    RetryAfter(Duration),
}

/// Per-stage attempt ceiling and backoff bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Base used when the failure was `rate_limited`.
    pub rate_limited_base_delay: Duration,
}

impl StagePolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, rate_limited_base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            rate_limited_base_delay,
        }
    }
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(10))
    }
}

/// Stage-aware retry decisions.
///
/// `next_action` is pure. Jitter is applied separately by [`RetryState`]
/// so the decision table stays deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub scrape: StagePolicy,
    pub analyze: StagePolicy,
    pub draft: StagePolicy,
    pub send: StagePolicy,
    /// Attempts allowed to end in `malformed_response` on generative stages.
    /// Counted apart from the network and rate-limit attempts.
    pub reformulation_ceiling: u32,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            scrape: StagePolicy::default(),
            analyze: StagePolicy::default(),
            draft: StagePolicy::default(),
            send: StagePolicy::default(),
            reformulation_ceiling: 2,
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Same ceiling and delays for every stage.
    pub fn uniform(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        let stage = StagePolicy::new(max_attempts, base_delay, base_delay * 5);
        Self {
            scrape: stage,
            analyze: stage,
            draft: stage,
            send: stage,
            max_delay,
            ..Self::default()
        }
    }

    pub fn for_stage(&self, stage: StageKind) -> &StagePolicy {
        match stage {
            StageKind::Scrape => &self.scrape,
            StageKind::Analyze => &self.analyze,
            StageKind::Draft => &self.draft,
            StageKind::Send => &self.send,
        }
    }

    /// Attempt ceiling that applies to `classification` at `stage`.
    pub fn ceiling(&self, classification: Classification, stage: StageKind) -> u32 {
        if classification == Classification::MalformedResponse {
            self.reformulation_ceiling
        } else {
            self.for_stage(stage).max_attempts
        }
    }

    /// Decide after the `attempt_number`-th (1-based) failure of this kind.
    pub fn next_action(&self, classification: Classification, attempt_number: u32, stage: StageKind) -> RetryAction {
        if !classification.is_retryable_for(stage)
            || attempt_number >= self.ceiling(classification, stage)
        {
            return RetryAction::Abort;
        }
        RetryAction::RetryAfter(self.backoff(classification, attempt_number, stage))
    }

    /// `base * 2^(n-1)`, capped at `max_delay`.
    pub fn backoff(&self, classification: Classification, attempt_number: u32, stage: StageKind) -> Duration {
        let policy = self.for_stage(stage);
        let base = if classification == Classification::RateLimited {
            policy.rate_limited_base_delay
        } else {
            policy.base_delay
        };
        let exponent = attempt_number.saturating_sub(1).min(31);
        base.checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Add up to `jitter * delay`, where `sample` is drawn from `[0, 1)`.
    pub fn with_jitter(&self, delay: Duration, sample: f64) -> Duration {
        let factor = self.jitter.clamp(0.0, 0.99) * sample.clamp(0.0, 1.0);
        (delay + delay.mul_f64(factor)).min(self.max_delay)
    }
}

/// Retry bookkeeping for one stage invocation.
///
/// Holds the counters and the next eligible time so a wait can be resumed
/// by whatever drives the orchestrator.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub stage: StageKind,
    /// Failures counted against the stage ceiling.
    pub attempts: u32,
    /// Failures counted against the reformulation ceiling.
    pub reformulations: u32,
    pub next_eligible_at: Option<Instant>,
}

impl RetryState {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            attempts: 0,
            reformulations: 0,
            next_eligible_at: None,
        }
    }

    /// Count a failure and decide what happens next.
    pub fn record_failure(&mut self, policy: &RetryPolicy, classification: Classification) -> RetryAction {
        let attempt_number = if classification == Classification::MalformedResponse {
            self.reformulations += 1;
            self.reformulations
        } else {
            self.attempts += 1;
            self.attempts
        };

        let action = match policy.next_action(classification, attempt_number, self.stage) {
            RetryAction::RetryAfter(delay) => {
                let sample: f64 = rand::thread_rng().r#gen();
                RetryAction::RetryAfter(policy.with_jitter(delay, sample))
            }
            RetryAction::Abort => RetryAction::Abort,
        };

        self.next_eligible_at = match action {
            RetryAction::RetryAfter(delay) => Some(Instant::now() + delay),
            RetryAction::Abort => None,
        };
        debug!(
            stage = %self.stage,
            %classification,
            attempt_number,
            action = ?action,
            "Retry decision"
        );
        action
    }

    /// Wait until the next attempt is eligible.
    ///
    /// Returns `false` if cancelled first.
    pub async fn wait(&mut self, cancel: &CancelToken) -> bool {
        let Some(at) = self.next_eligible_at else {
            return !cancel.is_cancelled();
        };
        tokio::select! {
            _ = tokio::time::sleep_until(at) => {
                self.next_eligible_at = None;
                true
            }
            _ = cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAGES: [StageKind; 4] = [
        StageKind::Scrape,
        StageKind::Analyze,
        StageKind::Draft,
        StageKind::Send,
    ];

    #[test]
    fn decision_table_matches_fatal_set_and_ceiling() {
        let policy = RetryPolicy::default();
        for stage in STAGES {
            for c in Classification::ALL {
                let ceiling = policy.ceiling(c, stage);
                for n in 1..=ceiling + 1 {
                    let action = policy.next_action(c, n, stage);
                    let should_abort = !c.is_retryable_for(stage) || n >= ceiling;
                    assert_eq!(
                        action == RetryAction::Abort,
                        should_abort,
                        "{c} attempt {n} at {stage}"
                    );
                }
            }
        }
    }

    #[test]
    fn delays_strictly_increase_below_cap() {
        let mut policy = RetryPolicy::default();
        policy.scrape.max_attempts = 6;
        policy.max_delay = Duration::from_secs(3600);

        let delays: Vec<Duration> = (1..6)
            .map(|n| match policy.next_action(Classification::TransientNetwork, n, StageKind::Scrape) {
                RetryAction::RetryAfter(d) => d,
                RetryAction::Abort => panic!("unexpected abort at {n}"),
            })
            .collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn delays_never_exceed_cap() {
        let mut policy = RetryPolicy::default();
        policy.send.max_attempts = 40;
        for n in 1..40 {
            if let RetryAction::RetryAfter(d) =
                policy.next_action(Classification::RateLimited, n, StageKind::Send)
            {
                assert!(d <= policy.max_delay);
            }
        }
    }

    #[test]
    fn rate_limited_uses_longer_base() {
        let policy = RetryPolicy::default();
        let network = policy.backoff(Classification::TransientNetwork, 1, StageKind::Analyze);
        let limited = policy.backoff(Classification::RateLimited, 1, StageKind::Analyze);
        assert!(limited > network);
    }

    #[test]
    fn auth_error_aborts_on_first_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_action(Classification::AuthError, 1, StageKind::Send),
            RetryAction::Abort
        );
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::default();
        let base = Duration::from_secs(4);
        assert_eq!(policy.with_jitter(base, 0.0), base);
        let high = policy.with_jitter(base, 0.999);
        assert!(high > base && high < base + base.mul_f64(policy.jitter) + Duration::from_millis(1));
    }

    #[test]
    fn reformulations_are_counted_separately() {
        let policy = RetryPolicy::uniform(3, Duration::from_millis(1), Duration::from_millis(10));
        let mut state = RetryState::new(StageKind::Analyze);

        assert!(matches!(
            state.record_failure(&policy, Classification::TransientNetwork),
            RetryAction::RetryAfter(_)
        ));
        assert!(matches!(
            state.record_failure(&policy, Classification::MalformedResponse),
            RetryAction::RetryAfter(_)
        ));
        assert!(matches!(
            state.record_failure(&policy, Classification::TransientNetwork),
            RetryAction::RetryAfter(_)
        ));
        assert_eq!(state.attempts, 2);
        assert_eq!(state.reformulations, 1);

        assert_eq!(
            state.record_failure(&policy, Classification::MalformedResponse),
            RetryAction::Abort
        );
        assert!(state.next_eligible_at.is_none());
    }

    #[tokio::test]
    async fn wait_returns_false_when_cancelled() {
        let policy = RetryPolicy::uniform(3, Duration::from_secs(30), Duration::from_secs(60));
        let mut state = RetryState::new(StageKind::Scrape);
        state.record_failure(&policy, Classification::TransientNetwork);

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        assert!(!state.wait(&cancel).await);
    }

    #[tokio::test]
    async fn wait_elapses_for_short_delays() {
        let policy = RetryPolicy::uniform(3, Duration::from_millis(1), Duration::from_millis(5));
        let mut state = RetryState::new(StageKind::Scrape);
        state.record_failure(&policy, Classification::TransientNetwork);
        assert!(state.wait(&CancelToken::new()).await);
        assert!(state.next_eligible_at.is_none());
    }
}
