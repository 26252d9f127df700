//! Machine profiles: the store-backed domain the agent binary runs.
//!
//! Every live machine should carry the base profiles plus whatever extra
//! profiles its document lists under `profiles`. A [`ProfileBroker`] applies
//! them to the machine; the reconciler records what was applied back on the
//! machine document under `applied-profiles`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{EntityKind, EntityTag, MachineTag, ModelUuid};
use fleet_ports::{PortsError, PortsState};
use fleet_txn::{
    read_life, Assert, Attempt, DocumentFeed, Life, NotifyFeed, Op, Plan, Store,
    TransactionRunner, TxnError, MACHINES,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Desired, Domain, DomainError};
use crate::supervision::CancelToken;

/// Profile every machine carries.
pub const DEFAULT_PROFILE: &str = "default";

/// Applies profiles to machines.
#[async_trait]
pub trait ProfileBroker: Send + Sync {
    /// Profiles currently applied to the machine, if it was ever configured.
    async fn applied_profiles(
        &self,
        machine: &MachineTag,
        token: &CancelToken,
    ) -> Result<Option<Vec<String>>, DomainError>;

    /// Replace the machine's profiles. Must be idempotent.
    async fn apply_profiles(
        &self,
        machine: &MachineTag,
        profiles: &[String],
        token: &CancelToken,
    ) -> Result<(), DomainError>;

    /// Forget a machine that is gone for good.
    async fn remove_profiles(&self, machine: &MachineTag, token: &CancelToken) -> Result<(), DomainError>;
}

fn ports_error(err: PortsError) -> DomainError {
    if err.is_not_found() {
        DomainError::NotFound(err.to_string())
    } else if err.is_retryable() {
        DomainError::Transient(err.to_string())
    } else {
        DomainError::Permanent(err.to_string())
    }
}

/// Reconciles the profiles of every machine in one model.
pub struct ProfileDomain {
    store: Arc<dyn Store>,
    model: ModelUuid,
    runner: TransactionRunner,
    ports: PortsState,
    broker: Arc<dyn ProfileBroker>,
}

impl ProfileDomain {
    pub fn new(store: Arc<dyn Store>, model: ModelUuid, broker: Arc<dyn ProfileBroker>) -> Self {
        Self {
            runner: TransactionRunner::new(store.clone()).for_model(model),
            ports: PortsState::new(store.clone(), model),
            store,
            model,
            broker,
        }
    }

    /// Bound the attempts of every transaction this domain runs.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.runner = self.runner.with_max_attempts(max_attempts);
        self.ports = self.ports.with_max_attempts(max_attempts);
        self
    }

    /// Profiles every machine in the model carries, in application order.
    pub fn required_profiles(&self) -> Vec<String> {
        vec![DEFAULT_PROFILE.to_string(), format!("fleet-{}", self.model)]
    }

    fn machine(entity: &EntityTag) -> Result<MachineTag, DomainError> {
        if entity.kind() != EntityKind::Machine {
            return Err(DomainError::Permanent(format!("{entity} is not a machine")));
        }
        MachineTag::new(entity.id()).map_err(|e| DomainError::Permanent(e.to_string()))
    }

    fn doc_id(&self, machine: &MachineTag) -> String {
        self.model.doc_id(machine.id())
    }
}

#[async_trait]
impl Domain for ProfileDomain {
    type State = Vec<String>;

    fn name(&self) -> &str {
        "profiles"
    }

    /// Feed ids are model-scoped machine document ids.
    fn entity_for(&self, raw_id: &str) -> Option<EntityTag> {
        let local = raw_id.strip_prefix(&self.model.doc_id(""))?;
        MachineTag::new(local).ok().map(|tag| tag.entity())
    }

    async fn work_signal(&self, entity: &EntityTag) -> Result<Box<dyn NotifyFeed>, DomainError> {
        let machine = Self::machine(entity)?;
        Ok(Box::new(DocumentFeed::new(
            self.store.as_ref(),
            MACHINES,
            &self.doc_id(&machine),
        )))
    }

    async fn desired_state(
        &self,
        entity: &EntityTag,
        _token: &CancelToken,
    ) -> Result<Desired<Vec<String>>, DomainError> {
        let machine = Self::machine(entity)?;
        let found = self
            .store
            .find(MACHINES, &self.doc_id(&machine))
            .await
            .map_err(TxnError::from)?;
        let Some(doc) = found else {
            return Ok(Desired::Terminal);
        };
        if Life::of(&doc.body).is_dead() {
            return Ok(Desired::Terminal);
        }

        let mut profiles = self.required_profiles();
        let extra = doc.body.get("profiles").and_then(Value::as_array);
        for name in extra.into_iter().flatten().filter_map(Value::as_str) {
            if !profiles.iter().any(|p| p == name) {
                profiles.push(name.to_string());
            }
        }
        Ok(Desired::State(profiles))
    }

    async fn observed_state(
        &self,
        entity: &EntityTag,
        token: &CancelToken,
    ) -> Result<Option<Vec<String>>, DomainError> {
        let machine = Self::machine(entity)?;
        self.broker.applied_profiles(&machine, token).await
    }

    async fn reconcile(
        &self,
        entity: &EntityTag,
        desired: &Vec<String>,
        token: &CancelToken,
    ) -> Result<(), DomainError> {
        let machine = Self::machine(entity)?;
        self.broker.apply_profiles(&machine, desired, token).await?;

        let doc_id = self.doc_id(&machine);
        let fields = json!({ "applied-profiles": desired });
        let store = self.store.clone();
        self.runner
            .run((), |attempt: Attempt<()>| {
                let (store, doc_id, fields) = (store.clone(), doc_id.clone(), fields.clone());
                async move {
                    if attempt.is_retry() {
                        match read_life(store.as_ref(), MACHINES, &doc_id).await? {
                            Some(life) if !life.is_dead() => {}
                            _ => return Err(DomainError::NotFound(format!("machine {doc_id}"))),
                        }
                    }
                    let op = Op::set(MACHINES, doc_id, Assert::NotDead, fields);
                    Ok(((), Plan::Ops(vec![op])))
                }
            })
            .await?;

        info!(machine = %machine, profiles = ?desired, "Applied machine profiles");
        Ok(())
    }

    /// Releases a machine's profiles and opened ports once it is dead or
    /// removed. A live machine is left alone: the agent is merely stopping.
    async fn cleanup(&self, entity: &EntityTag, token: &CancelToken) -> Result<(), DomainError> {
        let machine = Self::machine(entity)?;
        if let Some(life) = read_life(self.store.as_ref(), MACHINES, &self.doc_id(&machine)).await? {
            if !life.is_dead() {
                debug!(machine = %machine, %life, "Machine still present, keeping profiles");
                return Ok(());
            }
        }

        self.broker.remove_profiles(&machine, token).await?;
        for mut ports in self.ports.all_machine_ports(machine.id()).await.map_err(ports_error)? {
            ports.remove().await.map_err(ports_error)?;
        }
        info!(machine = %machine, "Released machine profiles and ports");
        Ok(())
    }
}

// =============================================================================
// Mock Broker
// =============================================================================

/// In-memory broker for tests and for running the agent without a hypervisor.
#[derive(Debug, Default)]
pub struct MockBroker {
    applied: Mutex<BTreeMap<String, Vec<String>>>,
    applies: AtomicU64,
    fail_next: AtomicU32,
    delay: Duration,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every apply take `delay`, cut short by cancellation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `n` applies with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Profiles applied to a machine.
    pub fn applied(&self, machine_id: &str) -> Option<Vec<String>> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(machine_id)
            .cloned()
    }

    /// Successful applies so far.
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileBroker for MockBroker {
    async fn applied_profiles(
        &self,
        machine: &MachineTag,
        _token: &CancelToken,
    ) -> Result<Option<Vec<String>>, DomainError> {
        Ok(self.applied(machine.id()))
    }

    async fn apply_profiles(
        &self,
        machine: &MachineTag,
        profiles: &[String],
        token: &CancelToken,
    ) -> Result<(), DomainError> {
        if !self.delay.is_zero()
            && token
                .run_until_cancelled(tokio::time::sleep(self.delay))
                .await
                .is_none()
        {
            return Err(DomainError::Transient("cancelled".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DomainError::Transient("injected failure".into()));
        }

        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(machine.id().to_string(), profiles.to_vec());
        self.applies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_profiles(&self, machine: &MachineTag, _token: &CancelToken) -> Result<(), DomainError> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(machine.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_txn::{entity_doc, MemoryStore, MODELS};

    async fn domain() -> (Arc<dyn Store>, ModelUuid, ProfileDomain) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let model = ModelUuid::new();
        store
            .apply(&[
                Op::insert(MODELS, model.to_string(), entity_doc(Life::Alive)),
                Op::insert(
                    MACHINES,
                    model.doc_id("0"),
                    json!({ "life": "alive", "profiles": ["gpu", "default"] }),
                ),
            ])
            .await
            .unwrap();
        let domain = ProfileDomain::new(store.clone(), model, Arc::new(MockBroker::new()));
        (store, model, domain)
    }

    #[tokio::test]
    async fn test_entity_for_model_scoped_ids() {
        let (_, model, domain) = domain().await;
        let tag = domain.entity_for(&model.doc_id("0/lxd/1")).unwrap();
        assert_eq!(tag.kind(), EntityKind::Machine);
        assert_eq!(tag.id(), "0/lxd/1");

        assert!(domain.entity_for("0").is_none());
        assert!(domain.entity_for(&ModelUuid::new().doc_id("0")).is_none());
        assert!(domain.entity_for(&model.doc_id("web/0")).is_none());
    }

    #[tokio::test]
    async fn test_desired_state_merges_extra_profiles() {
        let (_, model, domain) = domain().await;
        let machine = MachineTag::new("0").unwrap().entity();
        let token = CancelToken::new();

        let desired = domain.desired_state(&machine, &token).await.unwrap();
        assert_eq!(
            desired,
            Desired::State(vec![
                "default".to_string(),
                format!("fleet-{model}"),
                "gpu".to_string(),
            ])
        );

        let missing = MachineTag::new("7").unwrap().entity();
        assert_eq!(
            domain.desired_state(&missing, &token).await.unwrap(),
            Desired::Terminal
        );
    }

    #[tokio::test]
    async fn test_reconcile_records_applied_profiles() {
        let (store, model, domain) = domain().await;
        let machine = MachineTag::new("0").unwrap().entity();
        let token = CancelToken::new();
        let profiles = domain.required_profiles();

        domain.reconcile(&machine, &profiles, &token).await.unwrap();

        assert_eq!(
            domain.observed_state(&machine, &token).await.unwrap(),
            Some(profiles.clone())
        );
        let doc = store.find(MACHINES, &model.doc_id("0")).await.unwrap().unwrap();
        assert_eq!(doc.body["applied-profiles"], json!(profiles));
    }

    #[tokio::test]
    async fn test_mock_broker_injected_failures() {
        let broker = MockBroker::new();
        let machine = MachineTag::new("0").unwrap();
        let token = CancelToken::new();
        broker.fail_next(1);

        let err = broker
            .apply_profiles(&machine, &["default".into()], &token)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        broker
            .apply_profiles(&machine, &["default".into()], &token)
            .await
            .unwrap();
        assert_eq!(broker.apply_count(), 1);
    }
}
