//! Optimistic-concurrency transaction runner.
//!
//! The caller supplies a builder that, given an [`Attempt`], inspects the
//! latest snapshot of whatever it is about to change and returns the ops to
//! submit. Attempt 0 runs against the caller's snapshot; when the store
//! aborts the ops because an assert no longer holds, the builder is invoked
//! again with the next attempt number so it can re-read and recompute. Only
//! aborted asserts are retried. Everything else, including an unreachable
//! store, goes straight back to the caller.
//!
//! ```text
//! attempt 0 ──build──> ops ──apply──> committed
//!                              │
//!                           aborted
//!                              │
//! attempt 1 ──refresh+build──> ops ──apply──> ...   (up to max_attempts)
//! ```

use std::future::Future;
use std::sync::Arc;

use fleet_id::ModelUuid;
use tracing::{debug, warn};

use crate::life::{assert_alive_op, check_alive, MODELS};
use crate::op::Op;
use crate::store::Store;
use crate::{StoreError, TxnError};

/// Default bound on attempts per `run` call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Per-attempt context handed to the builder.
#[derive(Debug, Clone)]
pub struct Attempt<S> {
    /// Zero for the first attempt.
    pub number: u32,

    /// The latest snapshot: the caller's initial one on attempt 0, otherwise
    /// whatever the previous attempt's builder returned.
    pub snapshot: S,
}

impl<S> Attempt<S> {
    /// Returns true if an earlier attempt lost a race.
    pub fn is_retry(&self) -> bool {
        self.number > 0
    }
}

/// What the builder wants to submit.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Submit these ops as one transaction.
    Ops(Vec<Op>),
    /// Nothing needs to change.
    NoOp,
}

/// Result of a successful `run`.
#[derive(Debug, Clone)]
pub struct Committed<S> {
    /// Snapshot returned by the final attempt.
    pub snapshot: S,

    /// False when the final attempt planned no change.
    pub applied: bool,

    /// Attempts used, including the final one.
    pub attempts: u32,
}

/// Runs builders against a store until one op list commits.
#[derive(Clone)]
pub struct TransactionRunner {
    store: Arc<dyn Store>,
    max_attempts: u32,
    model: Option<ModelUuid>,
}

impl TransactionRunner {
    /// Create a runner over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            model: None,
        }
    }

    /// Bound the number of attempts per call.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Guard every transaction on the model staying alive.
    ///
    /// Each op list gets a model-alive assert prepended, and retries fail
    /// fast once the model is no longer alive.
    #[must_use]
    pub fn for_model(mut self, model: ModelUuid) -> Self {
        self.model = Some(model);
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The guarded model, if any.
    pub fn model(&self) -> Option<ModelUuid> {
        self.model
    }

    /// Configured attempt bound.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fail unless the guarded model is alive.
    pub async fn check_model_active(&self) -> Result<(), TxnError> {
        match self.model {
            Some(model) => {
                check_alive(
                    self.store.as_ref(),
                    MODELS,
                    &model.to_string(),
                    &format!("model {model}"),
                )
                .await
            }
            None => Ok(()),
        }
    }

    /// Run `build` until its ops commit, it plans no change, or attempts run out.
    pub async fn run<S, E, F, Fut>(&self, initial: S, mut build: F) -> Result<Committed<S>, E>
    where
        S: Send,
        E: From<TxnError>,
        F: FnMut(Attempt<S>) -> Fut + Send,
        Fut: Future<Output = Result<(S, Plan), E>> + Send,
    {
        let mut snapshot = initial;

        for number in 0..self.max_attempts {
            if number > 0 {
                self.check_model_active().await?;
            }

            let (next, plan) = build(Attempt { number, snapshot }).await?;
            let mut ops = match plan {
                Plan::Ops(ops) if !ops.is_empty() => ops,
                Plan::Ops(_) | Plan::NoOp => {
                    debug!(attempt = number, "Transaction builder planned no change");
                    return Ok(Committed {
                        snapshot: next,
                        applied: false,
                        attempts: number + 1,
                    });
                }
            };
            if let Some(model) = self.model {
                ops.insert(0, assert_alive_op(MODELS, model.to_string()));
            }

            match self.store.apply(&ops).await {
                Ok(()) => {
                    debug!(attempt = number, ops = ops.len(), "Transaction committed");
                    return Ok(Committed {
                        snapshot: next,
                        applied: true,
                        attempts: number + 1,
                    });
                }
                Err(StoreError::Aborted {
                    collection,
                    id,
                    reason,
                }) => {
                    debug!(
                        attempt = number,
                        collection = %collection,
                        id = %id,
                        reason = %reason,
                        "Transaction aborted, retrying"
                    );
                    snapshot = next;
                }
                Err(e) => return Err(TxnError::Store(e).into()),
            }
        }

        warn!(
            attempts = self.max_attempts,
            "Transaction retries exhausted"
        );
        Err(TxnError::RetryExhausted {
            attempts: self.max_attempts,
        }
        .into())
    }
}
