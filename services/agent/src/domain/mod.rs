//! The boundary between reconcilers and the logic that knows what an entity
//! should look like.
//!
//! A [`Domain`] answers four questions for one entity at a time: what wakes
//! its reconciler up, what it should be, what it currently is, and how to
//! make the latter match the former. Everything the reconciler runtime does
//! (diffing, backoff, fingerprints, teardown) lives on the other side.

mod profile;
mod traced;

use std::fmt::Debug;

use async_trait::async_trait;
use fleet_id::EntityTag;
use fleet_txn::{NotifyFeed, TxnError};
use serde::Serialize;
use thiserror::Error;

use crate::supervision::CancelToken;

pub use profile::{MockBroker, ProfileBroker, ProfileDomain, DEFAULT_PROFILE};
pub use traced::Traced;

/// Desired state of an entity, or the news that it has none any more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desired<S> {
    State(S),
    /// The entity reached the end of its lifecycle; its reconciler exits.
    Terminal,
}

/// Errors reported by domain calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Worth retrying after a backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Retrying will not help.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The entity no longer exists.
    #[error("{0} not found")]
    NotFound(String),
}

impl DomainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::Transient(_))
    }
}

impl From<TxnError> for DomainError {
    fn from(err: TxnError) -> Self {
        if err.is_not_found() {
            DomainError::NotFound(err.to_string())
        } else if err.is_retryable() {
            DomainError::Transient(err.to_string())
        } else {
            DomainError::Permanent(err.to_string())
        }
    }
}

/// Domain logic driven by an [`EntityReconciler`](crate::supervision::EntityReconciler).
///
/// `reconcile` and `observed_state` may be called repeatedly with the same
/// desired state and must be idempotent.
#[async_trait]
pub trait Domain: Send + Sync + 'static {
    /// State compared between desired and observed, and fingerprinted.
    type State: Serialize + PartialEq + Clone + Debug + Send + Sync;

    /// Domain name for logging.
    fn name(&self) -> &str;

    /// Map a change-feed identifier to the entity it names.
    fn entity_for(&self, raw_id: &str) -> Option<EntityTag> {
        EntityTag::parse(raw_id).ok()
    }

    /// Feed that fires whenever the entity's desired state may have changed.
    /// Its first signal should be immediate.
    async fn work_signal(&self, entity: &EntityTag) -> Result<Box<dyn NotifyFeed>, DomainError>;

    async fn desired_state(
        &self,
        entity: &EntityTag,
        token: &CancelToken,
    ) -> Result<Desired<Self::State>, DomainError>;

    /// Last state actually applied, if any.
    async fn observed_state(
        &self,
        entity: &EntityTag,
        token: &CancelToken,
    ) -> Result<Option<Self::State>, DomainError>;

    /// Apply `desired` to the entity.
    async fn reconcile(
        &self,
        entity: &EntityTag,
        desired: &Self::State,
        token: &CancelToken,
    ) -> Result<(), DomainError>;

    /// Best-effort teardown once the reconciler stops.
    async fn cleanup(&self, _entity: &EntityTag, _token: &CancelToken) -> Result<(), DomainError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_txn::StoreError;

    #[test]
    fn test_txn_error_classification() {
        let unavailable = TxnError::Store(StoreError::Unavailable("down".into()));
        assert!(DomainError::from(unavailable).is_transient());

        let missing = DomainError::from(TxnError::NotFound("machine \"0\"".into()));
        assert!(matches!(missing, DomainError::NotFound(_)));

        let dead = DomainError::from(TxnError::NotAlive {
            entity: "machine \"0\"".into(),
        });
        assert!(matches!(dead, DomainError::Permanent(_)));
    }
}
