//! Outreach Agent: orchestration core for website-driven cold outreach.
//!
//! Prospects are scraped, analyzed, drafted and (after explicit
//! confirmation) sent, with every attempt recorded in an append-only log.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod outreach;
pub mod pipeline;
pub mod store;
