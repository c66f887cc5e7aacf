//! Persistence layer.
//!
//! `RecordStore` is the single async interface for outreach records;
//! `LibSqlBackend` is its libSQL implementation.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{RecordStore, TrackingUpdate};
