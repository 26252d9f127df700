//! Cancellation tokens, task handles and restart policy.
//!
//! A [`TaskHandle`] pairs a [`CancelToken`] with a single-assignment
//! completion slot:
//! - `cancel()` asks the task to stop at its next blocking point
//! - `done()` resolves once the task has finished, however it finished
//! - `result()` reads the slot without waiting
//! - `abort()` tears the task down without its cooperation
//!
//! The slot is filled from a drop guard owned by the spawned future, so it
//! is filled even when the task panics or is aborted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleet_reconcile::{BackoffPolicy, RetryTracker};
use fleet_txn::FeedError;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

// =============================================================================
// Errors
// =============================================================================

/// Why a supervised task ended unsuccessfully.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// A change feed closed underneath its consumer.
    #[error("change feed closed")]
    FeedClosed,

    /// A change feed failed for another reason.
    #[error("change feed failed: {0}")]
    Feed(String),

    /// A reconciler gave up converging its entity.
    #[error("reconciler for {entity} failed: {message}")]
    Reconciler { entity: String, message: String },

    /// Domain setup failed before any entity was reconciled.
    #[error("domain error: {0}")]
    Domain(String),

    /// The task was torn down before it could finish.
    #[error("task aborted")]
    Aborted,

    /// The task panicked.
    #[error("task {0} panicked")]
    Panicked(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<FeedError> for WorkerError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::Closed => WorkerError::FeedClosed,
            FeedError::Failed(message) => WorkerError::Feed(message),
        }
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative, one-way cancellation signal. Clones share the signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run `fut` unless the token is cancelled first, in which case `fut` is
    /// dropped and `None` is returned.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Completion
// =============================================================================

type Slot = Option<Result<(), WorkerError>>;

/// Read side of a task's completion slot.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Slot>,
}

impl Completion {
    /// Resolves once the slot is filled.
    pub async fn done(&self) {
        let mut rx = self.rx.clone();
        loop {
            if rx.borrow_and_update().is_some() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The task's outcome, or `None` while it is still running.
    pub fn result(&self) -> Option<Result<(), WorkerError>> {
        self.rx.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the task, then return its outcome.
    pub async fn wait(&self) -> Result<(), WorkerError> {
        self.done().await;
        self.result().unwrap_or(Err(WorkerError::Aborted))
    }
}

/// Fills the completion slot when the task's future is dropped.
struct CompletionGuard {
    name: String,
    tx: watch::Sender<Slot>,
    outcome: Option<Result<(), WorkerError>>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None if std::thread::panicking() => {
                warn!(task = %self.name, "Task panicked");
                Err(WorkerError::Panicked(self.name.clone()))
            }
            None => {
                debug!(task = %self.name, "Task aborted");
                Err(WorkerError::Aborted)
            }
        };
        self.tx.send_replace(Some(outcome));
    }
}

// =============================================================================
// Task Handle
// =============================================================================

/// A spawned task plus the means to stop it and observe its end.
///
/// Dropping the handle detaches the task; it keeps running.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    token: CancelToken,
    completion: Completion,
    abort: AbortHandle,
}

impl TaskHandle {
    /// Spawn `work` on the current runtime. `work` is expected to watch `token`.
    pub fn spawn<F>(name: impl Into<String>, token: CancelToken, work: F) -> Self
    where
        F: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = watch::channel(None);
        let mut guard = CompletionGuard {
            name: name.clone(),
            tx,
            outcome: None,
        };

        let join = tokio::spawn(async move {
            let outcome = work.await;
            guard.outcome = Some(outcome);
            drop(guard);
        });

        Self {
            name,
            token,
            completion: Completion { rx },
            abort: join.abort_handle(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Ask the task to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn done(&self) {
        self.completion.done().await;
    }

    pub fn result(&self) -> Option<Result<(), WorkerError>> {
        self.completion.result()
    }

    pub async fn wait(&self) -> Result<(), WorkerError> {
        self.completion.wait().await
    }

    /// Tear the task down at its next await point. The completion slot
    /// reports `Aborted` unless the task had already finished.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_done()
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

// =============================================================================
// Restart Policy
// =============================================================================

/// Restart policy for a supervised tree.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum restarts within the window.
    pub max_restarts: u32,

    /// Time window for counting restarts.
    pub window: Duration,

    /// Backoff between restarts.
    pub backoff: BackoffPolicy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(300),
            backoff: BackoffPolicy {
                base: Duration::from_millis(500),
                max: Duration::from_secs(30),
                jitter: 0.25,
            },
        }
    }
}

impl RestartPolicy {
    /// A tracker counting restarts against this policy's budget.
    pub fn tracker(&self) -> RetryTracker {
        RetryTracker::new(self.max_restarts, self.window)
    }
}
