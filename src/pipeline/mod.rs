//! Outreach pipeline.
//!
//! Every prospect flows through:
//! 1. `ScrapeExecutor`: fetch and clean the prospect's pages
//! 2. `AnalyzeExecutor`: structured business analysis
//! 3. `DraftExecutor`: personalized email draft
//! 4. `SendExecutor`: dispatch, only after explicit confirmation
//!
//! The `Orchestrator` owns persistence and retries; `BatchRunner` runs many
//! prospects with per-record isolation.

pub mod batch;
pub mod cancel;
pub mod executor;
pub mod orchestrator;
pub mod retry;
pub mod types;

pub use batch::{BatchConfig, BatchEntry, BatchRunner, BatchSummary, EntryOutcome, Prospect};
pub use cancel::CancelToken;
pub use executor::{AnalyzeExecutor, DraftExecutor, ScrapeExecutor, SendExecutor, StageExecutor};
pub use orchestrator::{Capabilities, Orchestrator, OrchestratorConfig};
pub use retry::{RetryAction, RetryPolicy, RetryState, StagePolicy};
pub use types::{Classification, StageKind, StageResult};
