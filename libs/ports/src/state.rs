//! Loading opened-ports documents for a model.

use std::sync::Arc;

use fleet_id::ModelUuid;
use fleet_txn::{
    load, read_life, Assert, Attempt, Life, Op, Plan, Store, TransactionRunner, TxnError,
    MACHINES, SUBNETS, UNITS,
};
use tracing::debug;

use crate::document::{Ports, PortsDoc, OPENED_PORTS};
use crate::key::ports_global_key;
use crate::ops::{remove_ports_doc_ops, set_ports_doc_ops};
use crate::PortsError;

/// Entry point for the opened-ports documents of one model.
#[derive(Clone)]
pub struct PortsState {
    runner: TransactionRunner,
    model: ModelUuid,
}

impl PortsState {
    /// Bind to a model; every transaction is guarded on the model being alive.
    pub fn new(store: Arc<dyn Store>, model: ModelUuid) -> Self {
        Self {
            runner: TransactionRunner::new(store).for_model(model),
            model,
        }
    }

    /// Bound the attempts of every transaction.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.runner = self.runner.with_max_attempts(max_attempts);
        self
    }

    pub fn model(&self) -> ModelUuid {
        self.model
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.runner.store()
    }

    pub fn runner(&self) -> &TransactionRunner {
        &self.runner
    }

    pub(crate) async fn find_doc(&self, doc_id: &str) -> Result<Option<(i64, PortsDoc)>, PortsError> {
        Ok(load(self.store().as_ref(), OPENED_PORTS, doc_id).await?)
    }

    /// Fail unless the subnet, when set, exists and is alive.
    pub(crate) async fn verify_subnet_alive_when_set(&self, subnet_id: &str) -> Result<(), PortsError> {
        if subnet_id.is_empty() {
            return Ok(());
        }
        match read_life(self.store().as_ref(), SUBNETS, &self.model.doc_id(subnet_id)).await? {
            None => Err(PortsError::NotFound(format!("subnet {subnet_id:?}"))),
            Some(Life::Alive) => Ok(()),
            Some(_) => Err(PortsError::SubnetNotAlive(subnet_id.to_string())),
        }
    }

    /// Fail fast when the machine or unit an append depends on is gone or dead.
    pub(crate) async fn check_referents(
        &self,
        machine_id: &str,
        unit_name: Option<&str>,
    ) -> Result<(), PortsError> {
        let mut referents = vec![(MACHINES, "machine", machine_id)];
        if let Some(unit) = unit_name {
            referents.push((UNITS, "unit", unit));
        }
        for (collection, what, id) in referents {
            match read_life(self.store().as_ref(), collection, &self.model.doc_id(id)).await? {
                None => return Err(PortsError::NotFound(format!("{what} {id:?}"))),
                Some(Life::Dead) => {
                    return Err(TxnError::NotAlive {
                        entity: format!("{what} {id:?}"),
                    }
                    .into())
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// The stored document for a machine and subnet, or `NotFound`.
    pub async fn get_ports(&self, machine_id: &str, subnet_id: &str) -> Result<Ports, PortsError> {
        let doc_id = self.model.doc_id(&ports_global_key(machine_id, subnet_id));
        match self.find_doc(&doc_id).await? {
            Some((revno, doc)) => Ok(Ports::stored(self.clone(), revno, doc)),
            None => Err(PortsError::NotFound(format!(
                "ports for machine {machine_id:?}, subnet {subnet_id:?}"
            ))),
        }
    }

    /// The stored document, or a new unsaved one.
    pub async fn get_or_create_ports(
        &self,
        machine_id: &str,
        subnet_id: &str,
    ) -> Result<Ports, PortsError> {
        if !fleet_id::is_valid_machine(machine_id) {
            return Err(PortsError::InvalidKey(ports_global_key(machine_id, subnet_id)));
        }
        match self.get_ports(machine_id, subnet_id).await {
            Ok(ports) => Ok(ports),
            Err(PortsError::NotFound(_)) => {
                let doc = PortsDoc::new(self.model, machine_id, subnet_id);
                Ok(Ports::unsaved(self.clone(), doc))
            }
            Err(e) => Err(e),
        }
    }

    /// The stored document for a machine and subnet, if any.
    pub async fn machine_ports(
        &self,
        machine_id: &str,
        subnet_id: &str,
    ) -> Result<Option<Ports>, PortsError> {
        match self.get_ports(machine_id, subnet_id).await {
            Ok(ports) => Ok(Some(ports)),
            Err(PortsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every stored document of a machine, across subnets.
    pub async fn all_machine_ports(&self, machine_id: &str) -> Result<Vec<Ports>, PortsError> {
        let mut all = Vec::new();
        for (_, stored) in self.store().find_all(OPENED_PORTS).await? {
            let doc: PortsDoc = stored.decode()?;
            if doc.model_uuid == self.model && doc.machine_id == machine_id {
                all.push(Ports::stored(self.clone(), stored.revno, doc));
            }
        }
        Ok(all)
    }

    /// Ops dropping every range of `unit_name` from its assigned machine.
    ///
    /// Documents left empty are deleted. A unit with no assigned machine, or
    /// whose machine is gone, yields no ops; a dead machine is an error.
    pub async fn remove_ports_for_unit_ops(&self, unit_name: &str) -> Result<Vec<Op>, PortsError> {
        let unit = self
            .store()
            .find(UNITS, &self.model.doc_id(unit_name))
            .await?;
        let Some(machine_id) = unit
            .as_ref()
            .and_then(|doc| doc.body.get("machine-id"))
            .and_then(|v| v.as_str())
        else {
            return Ok(Vec::new());
        };
        let Some(machine) = self
            .store()
            .find(MACHINES, &self.model.doc_id(machine_id))
            .await?
        else {
            return Ok(Vec::new());
        };
        if Life::of(&machine.body).is_dead() {
            return Err(TxnError::NotAlive {
                entity: format!("machine {machine_id:?}"),
            }
            .into());
        }

        let mut ops = Vec::new();
        for ports in self.all_machine_ports(machine_id).await? {
            let keep: Vec<_> = ports
                .ranges()
                .iter()
                .filter(|p| p.unit_name != unit_name)
                .cloned()
                .collect();
            if keep.len() == ports.ranges().len() {
                continue;
            }
            if keep.is_empty() {
                ops.extend(remove_ports_doc_ops(ports.doc(), Assert::Revno(ports.revno())));
            } else {
                ops.extend(set_ports_doc_ops(self.model, ports.doc(), ports.revno(), &keep)?);
            }
        }
        Ok(ops)
    }

    /// Drop every range of `unit_name`, retrying against concurrent writers.
    ///
    /// Returns true if anything was removed.
    pub async fn remove_ports_for_unit(&self, unit_name: &str) -> Result<bool, PortsError> {
        let committed = self
            .runner
            .run((), |_: Attempt<()>| async move {
                let ops = self.remove_ports_for_unit_ops(unit_name).await?;
                Ok::<_, PortsError>(((), Plan::Ops(ops)))
            })
            .await?;
        debug!(unit = unit_name, removed = committed.applied, "Removed unit ports");
        Ok(committed.applied)
    }
}
