//! Outreach records: data model, lifecycle state machine, and follow-up views.

pub mod model;
pub mod state;
pub mod tracking;

pub use model::{
    AttemptEvent, AttemptKind, AttemptOutcome, Draft, Note, OutreachRecord, Stage, Tracking,
};
pub use state::{FailureReport, Projection, TransitionError};
pub use tracking::{FollowUpBuckets, OutreachStats};
