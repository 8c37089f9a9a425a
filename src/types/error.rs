//! Error types for the progression engine
//!
//! Awarding XP never fails. Only flushes, daily-login claims and cached reads
//! surface these, and flush failures are mostly recovered by requeuing.

use crate::cache::MembershipKey;

/// Main error type for progression operations
#[derive(Debug, thiserror::Error)]
pub enum ProgressionError {
    #[error("Not a member: {0}")]
    NotMember(MembershipKey),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Store call timed out: {0}")]
    Timeout(&'static str),

    /// Returned by a store asked to commit a non-positive transaction.
    /// Award intake never raises it; bad awards are dropped and logged.
    #[error("Invalid XP amount: {0}")]
    InvalidAmount(i64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProgressionError {
    /// Whether a flush that failed with this error should be requeued and retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::TransactionConflict(_) | Self::Timeout(_)
        )
    }

    /// Short label used in structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotMember(_) => "not_member",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::TransactionConflict(_) => "transaction_conflict",
            Self::Timeout(_) => "timeout",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ProgressionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

/// Result type alias for progression operations
pub type Result<T> = std::result::Result<T, ProgressionError>;
