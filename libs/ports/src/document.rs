//! The opened-ports document of one machine in one subnet.
//!
//! A [`Ports`] value is a local snapshot of the stored document plus its
//! revision. Mutators submit conditional transactions built from the latest
//! snapshot; on an aborted attempt they re-read the document and rebuild, so
//! a concurrent writer's commit is never overwritten.

use std::collections::BTreeMap;
use std::fmt;

use fleet_id::ModelUuid;
use fleet_txn::{Assert, Attempt, Plan};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::key::ports_global_key;
use crate::ops::{add_ports_doc_ops, remove_ports_doc_ops, set_ports_doc_ops, update_ports_doc_ops};
use crate::state::PortsState;
use crate::{PortRange, PortsError, Protocol};

/// Collection holding opened-ports documents.
pub const OPENED_PORTS: &str = "openedPorts";

/// Stored body of an opened-ports document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortsDoc {
    #[serde(rename = "_id")]
    pub doc_id: String,
    pub model_uuid: ModelUuid,
    pub machine_id: String,
    pub subnet_id: String,
    #[serde(default)]
    pub ports: Vec<PortRange>,
}

impl PortsDoc {
    /// Empty document for a machine and subnet, not yet stored.
    pub fn new(model: ModelUuid, machine_id: &str, subnet_id: &str) -> Self {
        Self {
            doc_id: model.doc_id(&ports_global_key(machine_id, subnet_id)),
            model_uuid: model,
            machine_id: machine_id.to_string(),
            subnet_id: subnet_id.to_string(),
            ports: Vec::new(),
        }
    }
}

/// Port range without its owning unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkRange {
    pub from_port: i32,
    pub to_port: i32,
    pub protocol: Protocol,
}

impl fmt::Display for NetworkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protocol.has_ports() {
            write!(f, "{}-{}/{}", self.from_port, self.to_port, self.protocol)
        } else {
            write!(f, "{}", self.protocol)
        }
    }
}

/// Snapshot threaded through transaction attempts.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub doc: PortsDoc,
    pub revno: i64,
    pub is_new: bool,
}

impl Snapshot {
    fn gone(mut self) -> Self {
        self.doc.ports.clear();
        self.revno = 0;
        self.is_new = true;
        self
    }

    /// Replace with the stored document, or mark as not stored.
    async fn reload(self, state: &PortsState) -> Result<Self, PortsError> {
        match state.find_doc(&self.doc.doc_id).await? {
            Some((revno, doc)) => Ok(Self {
                doc,
                revno,
                is_new: false,
            }),
            None => Ok(self.gone()),
        }
    }
}

/// Whether `range` is already open; fails if it conflicts with an open range.
fn already_open(ports: &[PortRange], range: &PortRange) -> Result<bool, PortsError> {
    for existing in ports {
        existing.check_conflicts(range)?;
    }
    Ok(ports.contains(range))
}

/// Ranges left once `range` is closed, or `None` if it is not open. A
/// conflicting range of the same unit is an error.
fn left_after_close(
    ports: &[PortRange],
    range: &PortRange,
) -> Result<Option<Vec<PortRange>>, PortsError> {
    let mut found = false;
    let mut remaining = Vec::with_capacity(ports.len());
    for existing in ports {
        if existing == range {
            found = true;
            continue;
        }
        if existing.unit_name == range.unit_name {
            existing.check_conflicts(range)?;
        }
        remaining.push(existing.clone());
    }
    Ok(found.then_some(remaining))
}

/// Ports opened on one machine in one subnet.
#[derive(Clone)]
pub struct Ports {
    state: PortsState,
    snapshot: Snapshot,
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports")
            .field("doc", &self.snapshot.doc)
            .field("revno", &self.snapshot.revno)
            .field("is_new", &self.snapshot.is_new)
            .finish()
    }
}

impl fmt::Display for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ports for machine {:?}, subnet {:?}",
            self.snapshot.doc.machine_id, self.snapshot.doc.subnet_id
        )
    }
}

impl Ports {
    pub(crate) fn stored(state: PortsState, revno: i64, doc: PortsDoc) -> Self {
        Self {
            state,
            snapshot: Snapshot {
                doc,
                revno,
                is_new: false,
            },
        }
    }

    pub(crate) fn unsaved(state: PortsState, doc: PortsDoc) -> Self {
        Self {
            state,
            snapshot: Snapshot {
                doc,
                revno: 0,
                is_new: true,
            },
        }
    }

    pub(crate) fn doc(&self) -> &PortsDoc {
        &self.snapshot.doc
    }

    pub fn machine_id(&self) -> &str {
        &self.snapshot.doc.machine_id
    }

    pub fn subnet_id(&self) -> &str {
        &self.snapshot.doc.subnet_id
    }

    /// Store key of this document.
    pub fn doc_id(&self) -> &str {
        &self.snapshot.doc.doc_id
    }

    /// Revision of the snapshot; 0 while not stored.
    pub fn revno(&self) -> i64 {
        self.snapshot.revno
    }

    /// Returns true if the document has not been stored yet.
    pub fn is_new(&self) -> bool {
        self.snapshot.is_new
    }

    /// Every range in the snapshot.
    pub fn ranges(&self) -> &[PortRange] {
        &self.snapshot.doc.ports
    }

    /// Ranges opened by `unit_name`.
    pub fn ports_for_unit(&self, unit_name: &str) -> Vec<PortRange> {
        self.snapshot
            .doc
            .ports
            .iter()
            .filter(|p| p.unit_name == unit_name)
            .cloned()
            .collect()
    }

    /// Every range keyed by its bounds, mapped to the owning unit.
    pub fn all_port_ranges(&self) -> BTreeMap<NetworkRange, String> {
        self.snapshot
            .doc
            .ports
            .iter()
            .map(|p| {
                let range = NetworkRange {
                    from_port: p.from_port,
                    to_port: p.to_port,
                    protocol: p.protocol,
                };
                (range, p.unit_name.clone())
            })
            .collect()
    }

    /// Re-read the document, failing with `NotFound` if it is not stored.
    pub async fn refresh(&mut self) -> Result<(), PortsError> {
        match self.state.find_doc(&self.snapshot.doc.doc_id).await? {
            Some((revno, doc)) => {
                self.snapshot = Snapshot {
                    doc,
                    revno,
                    is_new: false,
                };
                Ok(())
            }
            None => Err(PortsError::NotFound(self.to_string())),
        }
    }

    /// Open `range`, creating the document if needed.
    ///
    /// Opening a range identical to one already open succeeds without
    /// writing anything.
    pub async fn open_ports(&mut self, range: PortRange) -> Result<(), PortsError> {
        range.validate()?;

        let state = self.state.clone();
        let committed = self
            .state
            .runner()
            .run(self.snapshot.clone(), |attempt: Attempt<Snapshot>| {
                let state = state.clone();
                let range = range.clone();
                async move {
                    let retry = attempt.is_retry();
                    let mut snap = attempt.snapshot;
                    if retry {
                        state.verify_subnet_alive_when_set(&snap.doc.subnet_id).await?;
                        state
                            .check_referents(&snap.doc.machine_id, Some(&range.unit_name))
                            .await?;
                        snap = snap.reload(&state).await?;
                    }

                    // Outcomes that write nothing must be decided on the
                    // stored document, not on the caller's copy.
                    let mut open = already_open(&snap.doc.ports, &range);
                    if !retry && !matches!(open, Ok(false)) {
                        snap = snap.reload(&state).await?;
                        open = already_open(&snap.doc.ports, &range);
                    }
                    if open? {
                        return Ok((snap, Plan::NoOp));
                    }

                    let model = state.model();
                    let ops = if snap.is_new {
                        add_ports_doc_ops(model, &snap.doc, &range)?
                    } else {
                        update_ports_doc_ops(model, &snap.doc, snap.revno, &range)?
                    };
                    snap.revno = if snap.is_new { 1 } else { snap.revno + 1 };
                    snap.is_new = false;
                    snap.doc.ports.push(range);
                    Ok::<_, PortsError>((snap, Plan::Ops(ops)))
                }
            })
            .await
            .inspect_err(|e| debug!(range = %range, error = %e, "Cannot open ports"))?;

        if committed.applied {
            info!(
                ports = %self,
                range = %range,
                attempts = committed.attempts,
                "Opened port range"
            );
        } else {
            debug!(ports = %self, range = %range, "Port range already open");
        }
        self.snapshot = committed.snapshot;
        Ok(())
    }

    /// Close exactly `range`.
    ///
    /// Closing the last range deletes the document. Closing a range that is
    /// not open succeeds unless the same unit holds a conflicting one.
    pub async fn close_ports(&mut self, range: PortRange) -> Result<(), PortsError> {
        range.validate()?;

        let state = self.state.clone();
        let committed = self
            .state
            .runner()
            .run(self.snapshot.clone(), |attempt: Attempt<Snapshot>| {
                let state = state.clone();
                let range = range.clone();
                async move {
                    let retry = attempt.is_retry();
                    let mut snap = attempt.snapshot;
                    if retry {
                        snap = snap.reload(&state).await?;
                        if snap.is_new {
                            return Ok((snap, Plan::NoOp));
                        }
                        state.verify_subnet_alive_when_set(&snap.doc.subnet_id).await?;
                        state.check_referents(&snap.doc.machine_id, None).await?;
                    }

                    let mut left = left_after_close(&snap.doc.ports, &range);
                    if !retry && !matches!(left, Ok(Some(_))) {
                        snap = snap.reload(&state).await?;
                        left = left_after_close(&snap.doc.ports, &range);
                    }
                    let Some(remaining) = left? else {
                        return Ok((snap, Plan::NoOp));
                    };

                    let model = state.model();
                    if remaining.is_empty() {
                        let ops = remove_ports_doc_ops(&snap.doc, Assert::Revno(snap.revno));
                        return Ok((snap.gone(), Plan::Ops(ops)));
                    }
                    let ops = set_ports_doc_ops(model, &snap.doc, snap.revno, &remaining)?;
                    snap.revno += 1;
                    snap.doc.ports = remaining;
                    Ok::<_, PortsError>((snap, Plan::Ops(ops)))
                }
            })
            .await
            .inspect_err(|e| debug!(range = %range, error = %e, "Cannot close ports"))?;

        if committed.applied {
            info!(
                ports = %self,
                range = %range,
                attempts = committed.attempts,
                "Closed port range"
            );
        }
        self.snapshot = committed.snapshot;
        Ok(())
    }

    /// Delete the document. Already gone is not an error.
    pub async fn remove(&mut self) -> Result<(), PortsError> {
        let state = self.state.clone();
        let committed = self
            .state
            .runner()
            .run(self.snapshot.clone(), |attempt: Attempt<Snapshot>| {
                let state = state.clone();
                async move {
                    let retry = attempt.is_retry();
                    let mut snap = attempt.snapshot;
                    if retry || snap.is_new {
                        snap = snap.reload(&state).await?;
                        if snap.is_new {
                            return Ok((snap, Plan::NoOp));
                        }
                    }
                    let ops = remove_ports_doc_ops(&snap.doc, Assert::DocExists);
                    Ok::<_, PortsError>((snap.gone(), Plan::Ops(ops)))
                }
            })
            .await?;

        if committed.applied {
            info!(ports = %self, "Removed ports document");
        }
        self.snapshot = committed.snapshot;
        Ok(())
    }
}
