//! Tracing decorator for domains.

use async_trait::async_trait;
use fleet_id::EntityTag;
use fleet_txn::NotifyFeed;
use tracing::{debug_span, warn, Instrument};

use super::{Desired, Domain, DomainError};
use crate::supervision::CancelToken;

/// Wraps a domain so every call runs inside a span naming the domain, the
/// entity and the call, and every failure is logged.
pub struct Traced<D> {
    inner: D,
}

impl<D: Domain> Traced<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

fn logged<T>(
    result: Result<T, DomainError>,
    domain: &str,
    entity: &EntityTag,
    call: &str,
) -> Result<T, DomainError> {
    result.inspect_err(|e| {
        warn!(domain, entity = %entity, call, error = %e, "Domain call failed");
    })
}

#[async_trait]
impl<D: Domain> Domain for Traced<D> {
    type State = D::State;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn entity_for(&self, raw_id: &str) -> Option<EntityTag> {
        self.inner.entity_for(raw_id)
    }

    async fn work_signal(&self, entity: &EntityTag) -> Result<Box<dyn NotifyFeed>, DomainError> {
        let span = debug_span!("work_signal", domain = self.name(), entity = %entity);
        let result = self.inner.work_signal(entity).instrument(span).await;
        logged(result, self.name(), entity, "work_signal")
    }

    async fn desired_state(
        &self,
        entity: &EntityTag,
        token: &CancelToken,
    ) -> Result<Desired<Self::State>, DomainError> {
        let span = debug_span!("desired_state", domain = self.name(), entity = %entity);
        let result = self.inner.desired_state(entity, token).instrument(span).await;
        logged(result, self.name(), entity, "desired_state")
    }

    async fn observed_state(
        &self,
        entity: &EntityTag,
        token: &CancelToken,
    ) -> Result<Option<Self::State>, DomainError> {
        let span = debug_span!("observed_state", domain = self.name(), entity = %entity);
        let result = self.inner.observed_state(entity, token).instrument(span).await;
        logged(result, self.name(), entity, "observed_state")
    }

    async fn reconcile(
        &self,
        entity: &EntityTag,
        desired: &Self::State,
        token: &CancelToken,
    ) -> Result<(), DomainError> {
        let span = debug_span!("reconcile", domain = self.name(), entity = %entity);
        let result = self.inner.reconcile(entity, desired, token).instrument(span).await;
        logged(result, self.name(), entity, "reconcile")
    }

    async fn cleanup(&self, entity: &EntityTag, token: &CancelToken) -> Result<(), DomainError> {
        let span = debug_span!("cleanup", domain = self.name(), entity = %entity);
        let result = self.inner.cleanup(entity, token).instrument(span).await;
        logged(result, self.name(), entity, "cleanup")
    }
}
