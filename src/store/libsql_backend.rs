//! libSQL backend: async `RecordStore` implementation.
//!
//! Supports local file and in-memory databases. Artifacts (page content,
//! analysis, draft, receipt) are stored as JSON columns; the attempt log
//! lives in its own insert-only table.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::outreach::{AttemptEvent, AttemptKind, Note, OutreachRecord, Stage, Tracking};
use crate::store::migrations;
use crate::store::traits::{RecordStore, TrackingUpdate};

/// libSQL record store.
///
/// One connection is shared by all operations. Multi-statement writes are
/// serialized through `write_lock` so transactions never interleave.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (dry runs and tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn load_attempts(&self, id: &str) -> Result<Vec<AttemptEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM attempt_events WHERE record_id = ?1 ORDER BY seq ASC"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_attempts: {e}")))?;

        let mut attempts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            attempts.push(row_to_attempt(&row)?);
        }
        Ok(attempts)
    }

    async fn load_notes(&self, id: &str) -> Result<Vec<Note>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT body, created_at FROM record_notes WHERE record_id = ?1 ORDER BY id ASC",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_notes: {e}")))?;

        let mut notes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let read = |e: libsql::Error| DatabaseError::Query(format!("note row: {e}"));
            let text: String = row.get(0).map_err(read)?;
            let created: String = row.get(1).map_err(read)?;
            notes.push(Note {
                at: parse_datetime(&created, "record_notes.created_at")?,
                text,
            });
        }
        Ok(notes)
    }

    /// Attach attempts and notes to a row read from `outreach_records`.
    async fn hydrate(&self, mut record: OutreachRecord) -> Result<OutreachRecord, DatabaseError> {
        record.attempts = self.load_attempts(&record.id).await?;
        record.tracking.notes = self.load_notes(&record.id).await?;
        Ok(record)
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<OutreachRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut shells = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            shells.push(row_to_record(&row).map_err(|e| {
                warn!(op, error = %e, "Unreadable record row");
                e
            })?);
        }

        let mut records = Vec::with_capacity(shells.len());
        for shell in shells {
            records.push(self.hydrate(shell).await?);
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text order is time order.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str, column: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("{column}: '{s}': {e}")))
}

fn parse_optional_datetime(s: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(|s| parse_datetime(s, column)).transpose()
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    opt_text(dt.map(fmt_datetime))
}

fn opt_json<T: Serialize>(value: Option<&T>) -> Result<libsql::Value, DatabaseError> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map(opt_text)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_json<T: DeserializeOwned>(s: Option<String>, column: &str) -> Result<Option<T>, DatabaseError> {
    s.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

const RECORD_COLUMNS: &str = "id, url, stage, recipient, content, analysis, draft, sent_at, receipt, opened_at, replied_at, follow_up_due_at, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "seq, kind, outcome, terminal, classification, detail, created_at";

/// Map a row (in `RECORD_COLUMNS` order) to a record without attempts or notes.
fn row_to_record(row: &libsql::Row) -> Result<OutreachRecord, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("record row: {e}"));

    let stage_str: String = row.get(2).map_err(read)?;
    let stage: Stage = stage_str.parse().map_err(DatabaseError::Serialization)?;
    let created: String = row.get(12).map_err(read)?;
    let updated: String = row.get(13).map_err(read)?;

    Ok(OutreachRecord {
        id: row.get(0).map_err(read)?,
        url: row.get(1).map_err(read)?,
        stage,
        recipient: row.get(3).ok(),
        content: parse_json(row.get(4).ok(), "content")?,
        analysis: parse_json(row.get(5).ok(), "analysis")?,
        draft: parse_json(row.get(6).ok(), "draft")?,
        sent_at: parse_optional_datetime(row.get(7).ok(), "sent_at")?,
        receipt: parse_json(row.get(8).ok(), "receipt")?,
        tracking: Tracking {
            opened_at: parse_optional_datetime(row.get(9).ok(), "opened_at")?,
            replied_at: parse_optional_datetime(row.get(10).ok(), "replied_at")?,
            follow_up_due_at: parse_optional_datetime(row.get(11).ok(), "follow_up_due_at")?,
            notes: Vec::new(),
        },
        attempts: Vec::new(),
        created_at: parse_datetime(&created, "created_at")?,
        updated_at: parse_datetime(&updated, "updated_at")?,
    })
}

/// Map a row (in `ATTEMPT_COLUMNS` order) to an attempt event.
fn row_to_attempt(row: &libsql::Row) -> Result<AttemptEvent, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("attempt row: {e}"));

    let seq: i64 = row.get(0).map_err(read)?;
    let kind: String = row.get(1).map_err(read)?;
    let outcome: String = row.get(2).map_err(read)?;
    let terminal: i64 = row.get(3).unwrap_or(0);
    let classification: Option<String> = row.get(4).ok();
    let created: String = row.get(6).map_err(read)?;

    Ok(AttemptEvent {
        seq: u32::try_from(seq).map_err(|e| DatabaseError::Serialization(format!("seq: {e}")))?,
        kind: kind.parse().map_err(DatabaseError::Serialization)?,
        outcome: outcome.parse().map_err(DatabaseError::Serialization)?,
        terminal: terminal != 0,
        classification: classification
            .map(|c| c.parse())
            .transpose()
            .map_err(DatabaseError::Serialization)?,
        detail: row.get(5).ok(),
        at: parse_datetime(&created, "attempt_events.created_at")?,
    })
}

// ── Transactional writes ────────────────────────────────────────────

/// Insert the attempt row and refresh the pipeline-owned columns of the
/// record row. Runs inside a transaction.
///
/// Tracking columns are only touched by a successful mark event, and then
/// only the one column that event asserts.
async fn write_attempt(
    conn: &Connection,
    record: &OutreachRecord,
    event: &AttemptEvent,
) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO attempt_events (record_id, {ATTEMPT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            record.id.as_str(),
            i64::from(event.seq),
            event.kind.as_str(),
            event.outcome.as_str(),
            i64::from(event.terminal),
            opt_text(event.classification.map(|c| c.as_str().to_string())),
            opt_text(event.detail.clone()),
            fmt_datetime(&event.at),
        ],
    )
    .await
    .map_err(|e| {
        DatabaseError::Constraint(format!(
            "append_attempt {} seq {}: {e}",
            record.id, event.seq
        ))
    })?;

    let updated = conn
        .execute(
            "UPDATE outreach_records SET stage = ?1, recipient = ?2, content = ?3, analysis = ?4, draft = ?5, sent_at = ?6, receipt = ?7, updated_at = ?8 WHERE id = ?9",
            params![
                record.stage.as_str(),
                opt_text(record.recipient.clone()),
                opt_json(record.content.as_ref())?,
                opt_json(record.analysis.as_ref())?,
                opt_json(record.draft.as_ref())?,
                opt_datetime(record.sent_at.as_ref()),
                opt_json(record.receipt.as_ref())?,
                fmt_datetime(&record.updated_at),
                record.id.as_str(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_attempt update: {e}")))?;

    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity: "outreach_record".into(),
            id: record.id.clone(),
        });
    }

    let mark = match event.kind {
        AttemptKind::MarkOpened => Some("opened_at"),
        AttemptKind::MarkReplied => Some("replied_at"),
        _ => None,
    };
    if let Some(column) = mark.filter(|_| event.is_success()) {
        conn.execute(
            &format!("UPDATE outreach_records SET {column} = ?1 WHERE id = ?2"),
            params![fmt_datetime(&event.at), record.id.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_attempt {column}: {e}")))?;
    }
    Ok(())
}

/// Apply one tracking change. Runs inside a transaction.
async fn write_tracking(conn: &Connection, id: &str, update: &TrackingUpdate) -> Result<(), DatabaseError> {
    let now = fmt_datetime(&Utc::now());
    let (column, value) = match update {
        TrackingUpdate::Opened(at) => ("opened_at", Some(fmt_datetime(at))),
        TrackingUpdate::Replied(at) => ("replied_at", Some(fmt_datetime(at))),
        TrackingUpdate::FollowUpDue(at) => ("follow_up_due_at", at.as_ref().map(fmt_datetime)),
        TrackingUpdate::Note(_) => ("updated_at", Some(now.clone())),
    };

    let updated = conn
        .execute(
            &format!("UPDATE outreach_records SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
            params![opt_text(value), now.as_str(), id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_tracking: {e}")))?;

    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity: "outreach_record".into(),
            id: id.to_string(),
        });
    }

    if let TrackingUpdate::Note(note) = update {
        conn.execute(
            "INSERT INTO record_notes (record_id, body, created_at) VALUES (?1, ?2, ?3)",
            params![id, note.text.as_str(), fmt_datetime(&note.at)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_tracking note: {e}")))?;
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl RecordStore for LibSqlBackend {
    async fn create_if_absent(&self, record: &OutreachRecord) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO outreach_records ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    record.id.as_str(),
                    record.url.as_str(),
                    record.stage.as_str(),
                    opt_text(record.recipient.clone()),
                    opt_json(record.content.as_ref())?,
                    opt_json(record.analysis.as_ref())?,
                    opt_json(record.draft.as_ref())?,
                    opt_datetime(record.sent_at.as_ref()),
                    opt_json(record.receipt.as_ref())?,
                    opt_datetime(record.tracking.opened_at.as_ref()),
                    opt_datetime(record.tracking.replied_at.as_ref()),
                    opt_datetime(record.tracking.follow_up_due_at.as_ref()),
                    fmt_datetime(&record.created_at),
                    fmt_datetime(&record.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_if_absent: {e}")))?;

        if inserted > 0 {
            debug!(record_id = %record.id, url = %record.url, "Record created");
        }
        Ok(inserted > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<OutreachRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM outreach_records WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        let shell = match rows.next().await {
            Ok(Some(row)) => row_to_record(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get: {e}"))),
        };
        Ok(Some(self.hydrate(shell).await?))
    }

    async fn append_attempt(
        &self,
        record: &OutreachRecord,
        event: &AttemptEvent,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("append_attempt begin: {e}")))?;

        if let Err(e) = write_attempt(&tx, record, event).await {
            let _ = tx.rollback().await;
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("append_attempt commit: {e}")))?;

        debug!(
            record_id = %record.id,
            seq = event.seq,
            kind = %event.kind,
            outcome = event.outcome.as_str(),
            stage = %record.stage,
            "Attempt appended"
        );
        Ok(())
    }

    async fn update_tracking(&self, id: &str, update: TrackingUpdate) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_tracking begin: {e}")))?;

        if let Err(e) = write_tracking(&tx, id, &update).await {
            let _ = tx.rollback().await;
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_tracking commit: {e}")))?;

        debug!(record_id = %id, update = ?update, "Tracking updated");
        Ok(())
    }

    async fn list(&self, stage: Option<Stage>) -> Result<Vec<OutreachRecord>, DatabaseError> {
        match stage {
            Some(stage) => {
                self.query_records(
                    &format!("SELECT {RECORD_COLUMNS} FROM outreach_records WHERE stage = ?1 ORDER BY created_at ASC, id ASC"),
                    params![stage.as_str()],
                    "list",
                )
                .await
            }
            None => {
                self.query_records(
                    &format!("SELECT {RECORD_COLUMNS} FROM outreach_records ORDER BY created_at ASC, id ASC"),
                    (),
                    "list",
                )
                .await
            }
        }
    }

    async fn follow_ups_due(&self, now: DateTime<Utc>) -> Result<Vec<OutreachRecord>, DatabaseError> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM outreach_records WHERE follow_up_due_at IS NOT NULL AND follow_up_due_at <= ?1 AND replied_at IS NULL ORDER BY follow_up_due_at ASC"
            ),
            params![fmt_datetime(&now)],
            "follow_ups_due",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Analysis, PageContent, Tone};
    use crate::outreach::{AttemptOutcome, Draft};
    use crate::pipeline::types::Classification;
    use chrono::Duration;

    async fn store() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn push(record: &mut OutreachRecord, mut event: AttemptEvent, stage: Stage) -> AttemptEvent {
        event.seq = record.attempts.len() as u32 + 1;
        record.attempts.push(event.clone());
        record.stage = stage;
        event
    }

    #[tokio::test]
    async fn create_is_idempotent_on_id() {
        let store = store().await;
        let record = OutreachRecord::new("https://acme.test", Utc::now());
        assert!(store.create_if_absent(&record).await.unwrap());
        assert!(!store.create_if_absent(&record).await.unwrap());
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_persists_attempts_and_artifacts() {
        let store = store().await;
        let mut record = OutreachRecord::new("https://acme.test", Utc::now());
        store.create_if_absent(&record).await.unwrap();

        let failed = push(
            &mut record,
            AttemptEvent::failure(
                AttemptKind::Scrape,
                AttemptOutcome::RetryableFailure,
                Classification::TransientNetwork,
                "timeout",
                false,
                Utc::now(),
            ),
            Stage::New,
        );
        store.append_attempt(&record, &failed).await.unwrap();

        record.content = Some(PageContent::single("https://acme.test", "We fix pipes."));
        let ok = push(&mut record, AttemptEvent::success(AttemptKind::Scrape, Utc::now()), Stage::Scraped);
        store.append_attempt(&record, &ok).await.unwrap();

        record.analysis = Some(Analysis {
            summary: "Plumbers".into(),
            ..Analysis::default()
        });
        record.draft = Some(Draft {
            subject: "Hi".into(),
            body: "Hello".into(),
            tone: Tone::Bold,
            generated_at: Utc::now(),
        });
        let ok = push(&mut record, AttemptEvent::success(AttemptKind::Analyze, Utc::now()), Stage::Analyzed);
        store.append_attempt(&record, &ok).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Analyzed);
        assert_eq!(loaded.attempts.len(), 3);
        assert_eq!(loaded.attempts[0].classification, Some(Classification::TransientNetwork));
        assert_eq!(loaded.attempts[0].detail.as_deref(), Some("timeout"));
        assert_eq!(loaded.content, record.content);
        assert_eq!(loaded.analysis, record.analysis);
        assert_eq!(loaded.draft.as_ref().unwrap().tone, Tone::Bold);
        assert_eq!(loaded.projection().unwrap().stage, Stage::Analyzed);
    }

    #[tokio::test]
    async fn duplicate_seq_is_rejected_and_state_untouched() {
        let store = store().await;
        let mut record = OutreachRecord::new("https://acme.test", Utc::now());
        store.create_if_absent(&record).await.unwrap();

        let ok = push(&mut record, AttemptEvent::success(AttemptKind::Scrape, Utc::now()), Stage::Scraped);
        store.append_attempt(&record, &ok).await.unwrap();

        let mut stale = record.clone();
        stale.stage = Stage::Failed;
        let err = store.append_attempt(&stale, &ok).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Scraped);
        assert_eq!(loaded.attempts.len(), 1);
    }

    #[tokio::test]
    async fn tracking_updates_and_notes() {
        let store = store().await;
        let record = OutreachRecord::new("https://acme.test", Utc::now());
        store.create_if_absent(&record).await.unwrap();

        let opened = Utc::now();
        store
            .update_tracking(&record.id, TrackingUpdate::Opened(opened))
            .await
            .unwrap();
        for text in ["left voicemail", "asked for pricing"] {
            store
                .update_tracking(
                    &record.id,
                    TrackingUpdate::Note(Note {
                        at: Utc::now(),
                        text: text.into(),
                    }),
                )
                .await
                .unwrap();
        }

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.tracking.opened_at.map(|t| t.timestamp_millis()),
            Some(opened.timestamp_millis())
        );
        let notes: Vec<&str> = loaded.tracking.notes.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(notes, vec!["left voicemail", "asked for pricing"]);

        let err = store
            .update_tracking("missing", TrackingUpdate::Replied(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn follow_ups_due_skips_future_and_replied() {
        let store = store().await;
        let now = Utc::now();
        let mut ids = Vec::new();
        for (i, (due_days, replied)) in [(-2, false), (3, false), (-1, true)].into_iter().enumerate() {
            let record = OutreachRecord::new(format!("https://p{i}.test"), now);
            store.create_if_absent(&record).await.unwrap();
            store
                .update_tracking(&record.id, TrackingUpdate::FollowUpDue(Some(now + Duration::days(due_days))))
                .await
                .unwrap();
            if replied {
                store
                    .update_tracking(&record.id, TrackingUpdate::Replied(now))
                    .await
                    .unwrap();
            }
            ids.push(record.id);
        }

        let due = store.follow_ups_due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, ids[0]);
    }

    #[tokio::test]
    async fn list_filters_by_stage() {
        let store = store().await;
        let mut a = OutreachRecord::new("https://a.test", Utc::now());
        let b = OutreachRecord::new("https://b.test", Utc::now());
        store.create_if_absent(&a).await.unwrap();
        store.create_if_absent(&b).await.unwrap();

        let ok = push(&mut a, AttemptEvent::success(AttemptKind::Scrape, Utc::now()), Stage::Scraped);
        store.append_attempt(&a, &ok).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let scraped = store.list(Some(Stage::Scraped)).await.unwrap();
        assert_eq!(scraped.len(), 1);
        assert_eq!(scraped[0].id, a.id);
    }

    #[tokio::test]
    async fn unreadable_rows_fail_listing_instead_of_vanishing() {
        let store = store().await;
        let good = OutreachRecord::new("https://good.test", Utc::now());
        let bad = OutreachRecord::new("https://bad.test", Utc::now());
        store.create_if_absent(&good).await.unwrap();
        store.create_if_absent(&bad).await.unwrap();

        store
            .conn()
            .execute(
                "UPDATE outreach_records SET created_at = 'yesterday-ish' WHERE id = ?1",
                params![bad.id.as_str()],
            )
            .await
            .unwrap();

        assert!(matches!(
            store.list(None).await.unwrap_err(),
            DatabaseError::Serialization(_)
        ));
        assert!(store.get(&bad.id).await.is_err());
        assert!(store.get(&good.id).await.unwrap().is_some());

        store
            .conn()
            .execute(
                "UPDATE outreach_records SET created_at = ?1, stage = 'limbo' WHERE id = ?2",
                params![fmt_datetime(&Utc::now()), bad.id.as_str()],
            )
            .await
            .unwrap();
        assert!(store.list(None).await.is_err());
    }

    #[test]
    fn sqlite_datetime_format_still_parses() {
        let parsed = parse_datetime("2026-03-02 09:00:00", "created_at").unwrap();
        assert_eq!(parsed.timestamp(), 1_772_442_000);
        assert!(parse_datetime("", "created_at").is_err());
    }

    #[tokio::test]
    async fn append_leaves_tracking_columns_alone() {
        let store = store().await;
        let mut record = OutreachRecord::new("https://acme.test", Utc::now());
        store.create_if_absent(&record).await.unwrap();

        let due = Utc::now() + Duration::days(3);
        store
            .update_tracking(&record.id, TrackingUpdate::FollowUpDue(Some(due)))
            .await
            .unwrap();

        let ok = push(&mut record, AttemptEvent::success(AttemptKind::Scrape, Utc::now()), Stage::Scraped);
        assert!(record.tracking.follow_up_due_at.is_none());
        store.append_attempt(&record, &ok).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Scraped);
        assert_eq!(
            loaded.tracking.follow_up_due_at.map(|t| t.timestamp_millis()),
            Some(due.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("outreach.db");
        let record = OutreachRecord::new("https://acme.test", Utc::now());
        {
            let store = LibSqlBackend::new_local(&path).await.unwrap();
            store.create_if_absent(&record).await.unwrap();
        }
        let store = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(store.get(&record.id).await.unwrap().is_some());
    }
}
