//! Error types for Kestrel.

use thiserror::Error;

use crate::page::{BlockId, TxnId};

/// Result type alias using KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Coarse classification of a [`KestrelError`].
///
/// Callers branch on the category instead of matching individual variants,
/// e.g. a B-tree or hash table reacts to `Capacity` by splitting or resizing
/// while every other category aborts the enclosing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before any work was done; never retryable.
    InvalidInput,
    /// A write would push a page past its byte budget.
    Capacity,
    /// A bounded wait expired.
    Timeout,
    /// A lock protocol violation (programming error).
    Concurrency,
    /// A commit flush failed.
    Transaction,
    /// Persisted bytes could not be read back.
    Corruption,
    /// A lookup found nothing.
    NotFound,
    /// The store or messaging collaborator failed.
    External,
    /// Anything else.
    Internal,
}

/// Errors that can occur in Kestrel operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Capacity errors
    #[error(
        "Page budget exceeded for {kind}: estimated {estimated} bytes, encoded {actual} bytes (budget {budget})"
    )]
    PageBudgetExceeded {
        kind: String,
        estimated: usize,
        actual: usize,
        budget: usize,
    },

    // Timeout errors
    #[error("Timed out after {waited_ms} ms waiting for {operation}")]
    Timeout { operation: String, waited_ms: u64 },

    // Concurrency errors
    #[error("Lock on block {block_id} is not held by transaction {txn_id}")]
    LockNotHeld { block_id: BlockId, txn_id: TxnId },

    // Transaction errors
    #[error("Transaction failed: {source}")]
    TransactionFailed {
        #[source]
        source: Box<KestrelError>,
    },

    #[error("Transaction {0} is no longer active")]
    TransactionClosed(TxnId),

    // Block errors
    #[error("Block not found: {block_id}")]
    BlockNotFound { block_id: BlockId },

    #[error("Block corrupted: {block_id}, reason: {reason}")]
    BlockCorrupted { block_id: BlockId, reason: String },

    #[error("Structure kind mismatch: expected {expected}, got {actual}")]
    KindMismatch { expected: String, actual: String },

    #[error("Codec error: {0}")]
    Codec(String),

    // Catalog errors
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Collaborator errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Messaging error: {0}")]
    Messaging(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Wraps an error as a transactional failure, keeping the original cause.
    pub fn transaction_failed(source: KestrelError) -> Self {
        match source {
            already @ KestrelError::TransactionFailed { .. } => already,
            other => KestrelError::TransactionFailed {
                source: Box::new(other),
            },
        }
    }

    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            KestrelError::InvalidInput(_)
            | KestrelError::InvalidParameter { .. }
            | KestrelError::TransactionClosed(_) => ErrorCategory::InvalidInput,
            KestrelError::PageBudgetExceeded { .. } => ErrorCategory::Capacity,
            KestrelError::Timeout { .. } => ErrorCategory::Timeout,
            KestrelError::LockNotHeld { .. } => ErrorCategory::Concurrency,
            KestrelError::TransactionFailed { .. } => ErrorCategory::Transaction,
            KestrelError::BlockCorrupted { .. }
            | KestrelError::KindMismatch { .. }
            | KestrelError::Codec(_) => ErrorCategory::Corruption,
            KestrelError::BlockNotFound { .. } | KestrelError::NotFound(_) => {
                ErrorCategory::NotFound
            }
            KestrelError::Io(_) | KestrelError::Store(_) | KestrelError::Messaging(_) => {
                ErrorCategory::External
            }
            KestrelError::AlreadyExists(_) | KestrelError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns true for errors that must abort the current operation without a local retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Timeout | ErrorCategory::Concurrency
        )
    }

    /// Returns the innermost cause of a wrapped transactional failure.
    pub fn root_cause(&self) -> &KestrelError {
        match self {
            KestrelError::TransactionFailed { source } => source.root_cause(),
            other => other,
        }
    }
}
