//! # fleet-ports
//!
//! Opened-ports documents: which port ranges each unit holds open on a
//! machine, per subnet.
//!
//! ## Design Principles
//!
//! - One document per `(machine, subnet)`, keyed `m#<machine>#<subnet>`
//! - Ranges of the same protocol may not overlap unless they are identical,
//!   owner included; opening an identical range again is a no-op
//! - A document is created on its first range and deleted with its last
//! - Every write is one conditional transaction asserting the revision it was
//!   computed from, plus the lifecycle of the machine, subnet and unit
//!
//! ## Example
//!
//! ```ignore
//! let state = PortsState::new(store, model);
//! let mut ports = state.get_or_create_ports("0", "").await?;
//! ports.open_ports(PortRange::new("web/0", 80, 80, Protocol::Tcp)?).await?;
//! ```

mod document;
mod error;
mod key;
mod ops;
mod range;
mod state;

pub use document::{NetworkRange, Ports, PortsDoc, OPENED_PORTS};
pub use error::PortsError;
pub use key::{parse_ports_key, ports_global_key};
pub use range::{PortRange, Protocol, MAX_PORT, MIN_PORT, NO_PORT};
pub use state::PortsState;
