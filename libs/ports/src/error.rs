//! Opened-ports error types.

use fleet_txn::{StoreError, TxnError};
use thiserror::Error;

use crate::PortRange;

/// Errors returned by port range validation and the ports document API.
#[derive(Debug, Error)]
pub enum PortsError {
    /// Malformed range: bad unit, protocol or bounds.
    #[error("invalid port range: {0}")]
    InvalidRange(String),

    /// Key not of the form `m#<machine>#<subnet>`.
    #[error("ports document key {0:?} not valid")]
    InvalidKey(String),

    /// Requested range overlaps an existing one.
    #[error("port ranges {existing} and {requested} conflict")]
    Conflict {
        existing: PortRange,
        requested: PortRange,
    },

    /// The document's subnet is no longer alive.
    #[error("subnet {0:?} not alive")]
    SubnetNotAlive(String),

    /// Document, machine or subnet does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Transaction or store failure.
    #[error(transparent)]
    Txn(#[from] TxnError),
}

impl PortsError {
    /// Returns true for overlapping ranges and lifecycle preconditions.
    pub fn is_conflict(&self) -> bool {
        match self {
            PortsError::Conflict { .. } | PortsError::SubnetNotAlive(_) => true,
            PortsError::Txn(e) => e.is_conflict(),
            _ => false,
        }
    }

    /// Returns true if a referenced document was missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            PortsError::NotFound(_) => true,
            PortsError::Txn(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Returns true if the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortsError::Txn(e) if e.is_retryable())
    }
}

impl From<StoreError> for PortsError {
    fn from(err: StoreError) -> Self {
        PortsError::Txn(err.into())
    }
}

impl From<serde_json::Error> for PortsError {
    fn from(err: serde_json::Error) -> Self {
        PortsError::Txn(err.into())
    }
}
