//! Error types for the outreach agent.

use crate::pipeline::types::Classification;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Outreach error: {0}")]
    Outreach(#[from] OutreachError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by orchestrator commands.
///
/// Stage failures never appear here; they are recorded on the record as
/// classified attempts. These are the cases a caller must handle.
#[derive(Debug, thiserror::Error)]
pub enum OutreachError {
    #[error("Record {id} not found")]
    NotFound { id: String },

    #[error("Record {id} is {stage}, cannot {action}")]
    InvalidTransition {
        id: String,
        stage: String,
        action: String,
    },

    #[error("Record {id} is corrupted: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

// ── Capability errors ───────────────────────────────────────────────

/// Failure reported by a [`Fetcher`](crate::capabilities::Fetcher).
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl FetchError {
    pub fn classification(&self) -> Classification {
        match self {
            Self::TransientNetwork(_) => Classification::TransientNetwork,
            Self::InvalidInput(_) => Classification::InvalidInput,
        }
    }
}

/// Failure reported by an [`Analyzer`](crate::capabilities::Analyzer).
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalyzeError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("analyzer error: {0}")]
    Other(String),
}

impl AnalyzeError {
    pub fn classification(&self) -> Classification {
        match self {
            Self::RateLimited(_) => Classification::RateLimited,
            Self::MalformedResponse(_) => Classification::MalformedResponse,
            Self::TransientNetwork(_) => Classification::TransientNetwork,
            Self::Other(_) => Classification::Unknown,
        }
    }
}

/// Failure reported by a [`Drafter`](crate::capabilities::Drafter).
#[derive(Debug, Clone, thiserror::Error)]
pub enum DraftError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("drafter error: {0}")]
    Other(String),
}

impl DraftError {
    pub fn classification(&self) -> Classification {
        match self {
            Self::RateLimited(_) => Classification::RateLimited,
            Self::MalformedResponse(_) => Classification::MalformedResponse,
            Self::TransientNetwork(_) => Classification::TransientNetwork,
            Self::Other(_) => Classification::Unknown,
        }
    }
}

/// Failure reported by a [`Dispatcher`](crate::capabilities::Dispatcher).
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("authentication failed: {0}")]
    AuthError(String),

    #[error("recipient rejected: {0}")]
    RecipientRejected(String),

    #[error("network error: {0}")]
    TransientNetwork(String),
}

impl SendError {
    pub fn classification(&self) -> Classification {
        match self {
            Self::AuthError(_) => Classification::AuthError,
            Self::RecipientRejected(_) => Classification::RecipientRejected,
            Self::TransientNetwork(_) => Classification::TransientNetwork,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
