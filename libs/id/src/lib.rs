//! # fleet-id
//!
//! Entity identifiers for the fleet orchestrator.
//!
//! ## Design Principles
//!
//! - Every reconciled unit (machine, container, unit, subnet) is named by a
//!   tag: a kind plus an id that is immutable once assigned
//! - Ids have a strict grammar per kind and are rejected at parse time
//! - Tags roundtrip through their canonical string form
//! - Typed tags prevent mixing a unit name where a machine id is expected
//!
//! ## Tag Format
//!
//! Tags render as `{kind}-{id}` with `/` in the id encoded as `-`:
//!
//! - `machine-0` (id `0`)
//! - `machine-0-lxd-1` (container id `0/lxd/1`)
//! - `unit-web-0` (id `web/0`)
//! - `subnet-42`
//!
//! Documents live inside a model, named by a [`ModelUuid`].

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
