//! Store and transaction error types.

use thiserror::Error;

/// Errors returned by a [`Store`](crate::Store) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A declared precondition no longer holds; nothing was written.
    #[error("transaction aborted: {collection}/{id}: {reason}")]
    Aborted {
        collection: String,
        id: String,
        reason: String,
    },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored document body could not be decoded.
    #[error("corrupt document {collection}/{id}: {reason}")]
    Corrupt {
        collection: String,
        id: String,
        reason: String,
    },
}

impl StoreError {
    /// Returns true if this error means an optimistic-concurrency precondition failed.
    pub fn is_aborted(&self) -> bool {
        matches!(self, StoreError::Aborted { .. })
    }
}

/// Errors returned by the [`TransactionRunner`](crate::TransactionRunner) and
/// the lifecycle helpers.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Every attempt lost an optimistic-concurrency race.
    #[error("state changing too quickly; try again soon (gave up after {attempts} attempts)")]
    RetryExhausted { attempts: u32 },

    /// The model or a referenced entity is no longer alive.
    #[error("{entity} is no longer alive")]
    NotAlive { entity: String },

    /// A referenced document does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TxnError {
    /// Returns true for errors the caller caused by racing a lifecycle change.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TxnError::NotAlive { .. })
    }

    /// Returns true if a referenced document was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TxnError::NotFound(_))
    }

    /// Returns true if the caller may retry the whole operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxnError::RetryExhausted { .. } | TxnError::Store(StoreError::Unavailable(_))
        )
    }
}
