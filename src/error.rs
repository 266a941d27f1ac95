//! Error types for Proposal Pilot.
//!
//! Item-scoped failures (`ItemError` and the engine/composer errors it wraps)
//! are caught by the batch scheduler and recorded in the run summary.
//! `RunError` aborts a run. Quota exhaustion is not an error at all; it is a
//! normal SKIP decision.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Generative text service errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Circuit open for provider {provider}, retry in {retry_in:?}")]
    CircuitOpen {
        provider: String,
        retry_in: Duration,
    },
}

/// Policy construction and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid policy field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Failed to parse policy: {0}")]
    Parse(String),

    #[error("IO error reading policy: {0}")]
    Io(#[from] std::io::Error),
}

/// Admission engine errors. Scoped to a single opportunity.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Opportunity {id} not found")]
    NotFound { id: String },

    #[error("Opportunity {id} failed validation: {reason}")]
    Validation { id: String, reason: String },
}

/// Draft composer errors. Scoped to a single opportunity.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("Generation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generative service returned an empty draft")]
    EmptyDraft,

    #[error("Failed to load submission history: {0}")]
    History(#[from] DatabaseError),

    #[error("Loading submission history timed out after {0:?}")]
    HistoryTimeout(Duration),
}

/// Failure of one opportunity within a run. The run continues.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("Store call {operation} failed: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: DatabaseError,
    },

    #[error("Store call {operation} timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },
}

/// Failure that prevents a run from starting or continuing.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Store unreachable during {operation}: {source}")]
    StoreUnavailable {
        operation: &'static str,
        #[source]
        source: DatabaseError,
    },

    #[error("Store call {operation} timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Invalid policy: {0}")]
    Policy(#[from] PolicyError),
}
