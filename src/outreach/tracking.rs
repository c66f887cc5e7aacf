//! Follow-up dashboard views computed from a full scan of records.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::outreach::model::{OutreachRecord, Stage};

/// Records with a follow-up date inside this window count as upcoming.
pub const UPCOMING_WINDOW_DAYS: i64 = 7;

/// Scheduled follow-ups grouped by urgency. Replied records are excluded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FollowUpBuckets {
    pub overdue: Vec<OutreachRecord>,
    pub upcoming: Vec<OutreachRecord>,
    pub later: Vec<OutreachRecord>,
}

impl FollowUpBuckets {
    pub fn from_records(records: Vec<OutreachRecord>, now: DateTime<Utc>) -> Self {
        let horizon = now + Duration::days(UPCOMING_WINDOW_DAYS);
        let mut buckets = Self::default();

        let mut scheduled: Vec<(DateTime<Utc>, OutreachRecord)> = records
            .into_iter()
            .filter(|r| r.tracking.replied_at.is_none() && r.stage != Stage::Failed)
            .filter_map(|r| r.tracking.follow_up_due_at.map(|due| (due, r)))
            .collect();
        scheduled.sort_by_key(|(due, _)| *due);

        for (due, record) in scheduled {
            if due <= now {
                buckets.overdue.push(record);
            } else if due <= horizon {
                buckets.upcoming.push(record);
            } else {
                buckets.later.push(record);
            }
        }
        buckets
    }

    pub fn is_empty(&self) -> bool {
        self.overdue.is_empty() && self.upcoming.is_empty() && self.later.is_empty()
    }
}

/// Aggregate counts across all records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutreachStats {
    pub total: usize,
    pub in_progress: usize,
    pub drafted: usize,
    pub awaiting_confirmation: usize,
    /// Sent at least once, including opened and replied.
    pub sent: usize,
    pub opened: usize,
    pub replied: usize,
    pub failed: usize,
    pub follow_ups_due: usize,
}

impl OutreachStats {
    pub fn from_records(records: &[OutreachRecord], now: DateTime<Utc>) -> Self {
        let mut stats = Self {
            total: records.len(),
            ..Self::default()
        };
        for record in records {
            match record.stage {
                Stage::New | Stage::Scraped | Stage::Analyzed => stats.in_progress += 1,
                Stage::Drafted => stats.drafted += 1,
                Stage::AwaitingConfirmation => stats.awaiting_confirmation += 1,
                Stage::Failed => stats.failed += 1,
                Stage::Sent | Stage::Opened | Stage::Replied => {}
            }
            if record.stage.is_delivered() {
                stats.sent += 1;
            }
            if record.tracking.opened_at.is_some() {
                stats.opened += 1;
            }
            if record.tracking.replied_at.is_some() {
                stats.replied += 1;
            }
            if record.tracking.replied_at.is_none()
                && record.tracking.follow_up_due_at.is_some_and(|due| due <= now)
            {
                stats.follow_ups_due += 1;
            }
        }
        stats
    }

    /// Replies per sent message, as a percentage.
    pub fn reply_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.replied as f64 * 100.0 / self.sent as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, stage: Stage, due_in_days: Option<i64>, now: DateTime<Utc>) -> OutreachRecord {
        let mut r = OutreachRecord::new(url, now);
        r.stage = stage;
        r.tracking.follow_up_due_at = due_in_days.map(|d| now + Duration::days(d));
        r
    }

    #[test]
    fn buckets_split_by_due_date() {
        let now = Utc::now();
        let mut replied = record("https://d.test", Stage::Replied, Some(-1), now);
        replied.tracking.replied_at = Some(now);

        let buckets = FollowUpBuckets::from_records(
            vec![
                record("https://later.test", Stage::Sent, Some(30), now),
                record("https://over.test", Stage::Sent, Some(-2), now),
                record("https://soon.test", Stage::Opened, Some(3), now),
                record("https://none.test", Stage::Sent, None, now),
                replied,
            ],
            now,
        );
        assert_eq!(buckets.overdue.len(), 1);
        assert_eq!(buckets.overdue[0].url, "https://over.test");
        assert_eq!(buckets.upcoming[0].url, "https://soon.test");
        assert_eq!(buckets.later[0].url, "https://later.test");
    }

    #[test]
    fn stats_count_delivery_funnel() {
        let now = Utc::now();
        let mut opened = record("https://b.test", Stage::Opened, Some(-1), now);
        opened.tracking.opened_at = Some(now);
        let mut replied = record("https://c.test", Stage::Replied, Some(-1), now);
        replied.tracking.replied_at = Some(now);

        let stats = OutreachStats::from_records(
            &[
                record("https://a.test", Stage::Sent, None, now),
                opened,
                replied,
                record("https://d.test", Stage::Drafted, None, now),
                record("https://e.test", Stage::Failed, None, now),
            ],
            now,
        );
        assert_eq!(stats.total, 5);
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.replied, 1);
        assert_eq!(stats.drafted, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.follow_ups_due, 1);
        assert!((stats.reply_rate() - 33.333).abs() < 0.01);
    }
}
