//! Fleet Agent Library
//!
//! The agent keeps one reconciler per live entity of a model and drives each
//! entity toward its desired state.
//!
//! ## Architecture
//!
//! ```text
//! SupervisionTree            (one per entity feed)
//! ├── EntityReconciler(id)   (per-entity convergence loop)
//! └── ...
//!          │
//!          ▼
//!       Domain               (desired / observed state and effects)
//! ```
//!
//! ## Modules
//!
//! - `supervision`: cancellation, task handles, the tree and the reconciler
//! - `domain`: the domain boundary and the machine profile domain
//! - `config`: environment configuration
//! - `bootstrap`: first-start seeding of the store

pub mod bootstrap;
pub mod config;
pub mod domain;
pub mod supervision;

pub use config::{AgentConfig, StoreBackend};
pub use domain::{Desired, Domain, DomainError, MockBroker, ProfileDomain, Traced};
pub use supervision::{
    CancelToken, SupervisionTree, TaskHandle, TreeConfig, TreePhase, TreeStatus, WorkerError,
};
