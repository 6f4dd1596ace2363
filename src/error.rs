// ⚠️ Error taxonomy for the ledger core
//
// - Validation → bad claim inputs, rejected before anything is written
// - Integrity  → missing owner/entry or unreadable stored values, fatal for the operation
// - Storage    → SQLite failures (transient from the worker pool's point of view)
//
// Lock contention is deliberately absent: a dropped duplicate trigger is not an error.

use crate::entities::{EntryId, OwnerId, OwnerKind};
use thiserror::Error;

// ============================================================================
// VALIDATION ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// LEDGER ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid claim: {0}")]
    Validation(#[from] ValidationError),

    #[error("owner {id} not found")]
    OwnerNotFound { id: OwnerId },

    #[error("{kind} owner {id} not found")]
    OwnerOfKindNotFound { kind: OwnerKind, id: OwnerId },

    #[error("ledger entry {0} not found")]
    EntryNotFound(EntryId),

    #[error("corrupt ledger row {id}: {detail}")]
    Corrupt { id: i64, detail: String },

    #[error("{0} exceeds the representable amount range")]
    Overflow(String),

    #[error("background task queue is closed")]
    QueueClosed,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Integrity and validation failures will not fix themselves on retry
    pub fn is_permanent(&self) -> bool {
        !matches!(self, LedgerError::Storage(_) | LedgerError::QueueClosed)
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
