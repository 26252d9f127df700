//! Op builders for opened-ports documents.
//!
//! Every write carries the referential asserts of the document: the machine
//! must not be dead and, when the document is scoped to a subnet, neither may
//! the subnet.

use fleet_id::ModelUuid;
use fleet_txn::{assert_not_dead_op, Assert, Op, MACHINES, SUBNETS, UNITS};
use serde_json::json;

use crate::document::{PortsDoc, OPENED_PORTS};
use crate::{PortRange, PortsError};

fn assert_referents_ops(model: ModelUuid, doc: &PortsDoc) -> Vec<Op> {
    let mut ops = vec![assert_not_dead_op(MACHINES, model.doc_id(&doc.machine_id))];
    if !doc.subnet_id.is_empty() {
        ops.push(assert_not_dead_op(SUBNETS, model.doc_id(&doc.subnet_id)));
    }
    ops
}

/// Create `doc` holding exactly `range`.
pub(crate) fn add_ports_doc_ops(
    model: ModelUuid,
    doc: &PortsDoc,
    range: &PortRange,
) -> Result<Vec<Op>, PortsError> {
    let mut created = doc.clone();
    created.ports = vec![range.clone()];

    let mut ops = assert_referents_ops(model, doc);
    ops.push(assert_not_dead_op(UNITS, model.doc_id(&range.unit_name)));
    ops.push(Op::insert(
        OPENED_PORTS,
        doc.doc_id.clone(),
        serde_json::to_value(&created)?,
    ));
    Ok(ops)
}

/// Append `range` to an existing document at revision `revno`.
pub(crate) fn update_ports_doc_ops(
    model: ModelUuid,
    doc: &PortsDoc,
    revno: i64,
    range: &PortRange,
) -> Result<Vec<Op>, PortsError> {
    let mut ops = assert_referents_ops(model, doc);
    ops.push(assert_not_dead_op(UNITS, model.doc_id(&range.unit_name)));
    ops.push(Op::add_to_set(
        OPENED_PORTS,
        doc.doc_id.clone(),
        Assert::Revno(revno),
        "ports",
        serde_json::to_value(range)?,
    ));
    Ok(ops)
}

/// Replace the ranges of an existing document at revision `revno`.
pub(crate) fn set_ports_doc_ops(
    model: ModelUuid,
    doc: &PortsDoc,
    revno: i64,
    ranges: &[PortRange],
) -> Result<Vec<Op>, PortsError> {
    let mut ops = assert_referents_ops(model, doc);
    ops.push(Op::set(
        OPENED_PORTS,
        doc.doc_id.clone(),
        Assert::Revno(revno),
        json!({ "ports": serde_json::to_value(ranges)? }),
    ));
    Ok(ops)
}

/// Delete a document.
pub(crate) fn remove_ports_doc_ops(doc: &PortsDoc, assert: Assert) -> Vec<Op> {
    vec![Op::remove(OPENED_PORTS, doc.doc_id.clone(), assert)]
}
