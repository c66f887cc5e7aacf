//! `RecordStore` trait: the single async interface for record persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::outreach::{AttemptEvent, Note, OutreachRecord, Stage};

/// One externally asserted tracking change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingUpdate {
    Opened(DateTime<Utc>),
    Replied(DateTime<Utc>),
    /// `None` clears the follow-up.
    FollowUpDue(Option<DateTime<Utc>>),
    Note(Note),
}

/// Durable mapping of record ids to their full history.
///
/// The attempt log is insert-only: `(record_id, seq)` is unique, so a
/// concurrent writer that raced on the same record fails instead of
/// overwriting.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record. Returns `false` if the id already exists.
    async fn create_if_absent(&self, record: &OutreachRecord) -> Result<bool, DatabaseError>;

    /// Load a record with its attempts and notes.
    async fn get(&self, id: &str) -> Result<Option<OutreachRecord>, DatabaseError>;

    /// Append `event` and persist the record's derived fields atomically.
    ///
    /// `record` must already contain `event` as its last attempt.
    async fn append_attempt(
        &self,
        record: &OutreachRecord,
        event: &AttemptEvent,
    ) -> Result<(), DatabaseError>;

    /// Apply one tracking change.
    async fn update_tracking(&self, id: &str, update: TrackingUpdate) -> Result<(), DatabaseError>;

    /// Full scan, oldest first, optionally restricted to one stage.
    async fn list(&self, stage: Option<Stage>) -> Result<Vec<OutreachRecord>, DatabaseError>;

    /// Records whose follow-up is due at or before `now` and that have no reply.
    async fn follow_ups_due(&self, now: DateTime<Utc>) -> Result<Vec<OutreachRecord>, DatabaseError>;
}
