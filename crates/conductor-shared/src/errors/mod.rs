//! # Conductor Error Types
//!
//! Unified error handling for the conductor platform. Every fallible
//! operation returns [`ConductorResult`]; the [`FailureKind`] taxonomy
//! drives retry, recovery, and DLQ-parking decisions.

use thiserror::Error;

pub mod classifier;

pub use classifier::{classify_db_error, classify_message, classify_sqlstate};

/// Conductor operation result type
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Failure taxonomy used by retry and parking policy.
///
/// `RetryableBusiness` is a semantic subclass of transient: it is only
/// produced by a process configuration's own retry predicate, never by the
/// storage/transport classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry with backoff; never park
    Transient,
    /// Surface to the caller; park to DLQ under command execution
    Permanent,
    /// Transient per the owning process configuration
    RetryableBusiness,
}

impl FailureKind {
    /// Short lowercase label for logs and DLQ `error_class` columns
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::RetryableBusiness => "retryable_business",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehensive error types for conductor operations
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON serialization/deserialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Process type already registered: {process_type}")]
    DuplicateRegistration { process_type: String },

    #[error("Unknown process type: {process_type}")]
    UnknownProcessType { process_type: String },

    #[error("Process not found: {process_id}")]
    ProcessNotFound { process_id: uuid::Uuid },

    #[error("Idempotency key already pending: {key}")]
    IdempotencyConflict { key: String },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Retryable business failure: {0}")]
    RetryableBusiness(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl ConductorError {
    /// Create a messaging error
    pub fn messaging(message: impl Into<String>) -> Self {
        Self::Messaging(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Classify this error into the three-valued failure taxonomy.
    ///
    /// Database errors route through the SQLSTATE/message classifier;
    /// everything unrecognized defaults to `Transient` (err on retry).
    pub fn kind(&self) -> FailureKind {
        match self {
            ConductorError::Database(e) => classify_db_error(e),
            ConductorError::Migration(_) => FailureKind::Permanent,
            ConductorError::Serialization(_) => FailureKind::Permanent,
            ConductorError::Messaging(msg) => classify_message(Some(msg)),
            ConductorError::Configuration(_) => FailureKind::Permanent,
            ConductorError::Validation(_) => FailureKind::Permanent,
            ConductorError::DuplicateRegistration { .. } => FailureKind::Permanent,
            ConductorError::UnknownProcessType { .. } => FailureKind::Permanent,
            ConductorError::ProcessNotFound { .. } => FailureKind::Permanent,
            ConductorError::IdempotencyConflict { .. } => FailureKind::Permanent,
            ConductorError::Transient(_) => FailureKind::Transient,
            ConductorError::Permanent(_) => FailureKind::Permanent,
            ConductorError::RetryableBusiness(_) => FailureKind::RetryableBusiness,
            ConductorError::ShuttingDown(_) => FailureKind::Transient,
        }
    }

    /// Check if the error is worth retrying
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), FailureKind::Permanent)
    }
}
