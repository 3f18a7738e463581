use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the cycle runner
#[derive(Error, Debug)]
pub enum CycleGuardError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Coordination errors
    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Idempotency storage error: {0}")]
    IdempotencyStorage(String),

    // Pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Order execution failed: {0}")]
    OrderExecution(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for CycleGuardError
pub type Result<T> = std::result::Result<T, CycleGuardError>;

/// Classification of everything that can end a cycle early.
///
/// Only some of these are failures worth paging anyone about: lock
/// contention and duplicates happen on every normal multi-runner tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleErrorKind {
    /// Another runner holds the cycle lock
    LockUnavailable,
    /// The lock store itself could not be reached
    LockStorage,
    /// The duplicate check could not be performed; the cycle was blocked
    IdempotencyStorage,
    /// The candle/action pair was already processed
    DuplicateDetected,
    /// The pipeline, oracle or exchange call failed, timed out or panicked
    Pipeline,
    /// The validator downgraded the oracle's action to hold
    ValidationOverride,
}

impl CycleErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleErrorKind::LockUnavailable => "lock_unavailable",
            CycleErrorKind::LockStorage => "lock_storage",
            CycleErrorKind::IdempotencyStorage => "idempotency_storage",
            CycleErrorKind::DuplicateDetected => "duplicate_detected",
            CycleErrorKind::Pipeline => "pipeline",
            CycleErrorKind::ValidationOverride => "validation_override",
        }
    }

    /// Whether this outcome should reach an operator
    pub fn is_alertable(&self) -> bool {
        matches!(
            self,
            CycleErrorKind::LockStorage
                | CycleErrorKind::IdempotencyStorage
                | CycleErrorKind::Pipeline
        )
    }
}

impl std::fmt::Display for CycleErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
