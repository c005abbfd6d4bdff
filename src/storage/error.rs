//! Storage layer error types.

use crate::storage::page::{PageId, TableId};
use crate::transaction::TransactionId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A lock wait exceeded its randomized deadline. The owning transaction
    /// must be aborted; retrying the single call is not allowed.
    #[error("{txn} timed out waiting for a lock on {page_id}; abort the transaction")]
    LockTimeout {
        txn: TransactionId,
        page_id: PageId,
    },

    #[error("tuple layout does not match the table schema")]
    SchemaMismatch,

    #[error("page {0} has no free slot")]
    PageFull(PageId),

    #[error("slot {slot} of {page_id} does not hold the given tuple")]
    TupleNotFound { page_id: PageId, slot: usize },

    #[error("tuple has no record id; it was never inserted")]
    MissingRecordId,

    /// Every cached page is dirty, so NO-STEAL forbids eviction until some
    /// transaction commits or aborts.
    #[error("buffer pool full: no clean page to evict")]
    ResourceExhausted,

    #[error("no heap file registered for table {0}")]
    UnknownTable(TableId),

    #[error("invalid page image for {page_id}: {reason}")]
    InvalidPage { page_id: PageId, reason: String },

    #[error("invalid field encoding: {0}")]
    InvalidField(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Transient errors signal the caller to abort the whole transaction and
    /// possibly retry it from the top.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::LockTimeout { .. })
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
