//! Supervision primitives and the reconciler runtime.
//!
//! ```text
//! SupervisionTree (one per change feed)
//! ├── EntityReconciler(entity A)
//! ├── EntityReconciler(entity B)
//! └── ...
//! ```

mod reconciler;
mod task;
mod tree;

pub use reconciler::{EntityReconciler, ReconcilerConfig, DEFAULT_CLEANUP_TIMEOUT};
pub use task::{CancelToken, Completion, RestartPolicy, TaskHandle, WorkerError};
pub use tree::{
    EntityPhase, FeedSemantics, SupervisionTree, TreeConfig, TreePhase, TreeStatus,
    DEFAULT_SHUTDOWN_GRACE,
};
