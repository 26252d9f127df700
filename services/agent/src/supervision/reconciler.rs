//! Per-entity reconciler.
//!
//! One reconciler drives one entity toward its desired state. It sleeps
//! until the domain's work signal fires, the tree nudges it, or a retry
//! backoff elapses, then runs one convergence pass:
//!
//! ```text
//! desired ──Terminal──> exit
//!    │
//! fingerprint == last applied ──> idle
//!    │
//! observed == desired ──> record fingerprint, idle
//!    │
//! reconcile ──ok──> record fingerprint, idle
//!           ──transient──> backoff, retry (until the budget runs out)
//!           ──permanent──> fail
//! ```
//!
//! Cleanup always runs on the way out, bounded by `cleanup_timeout`.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::EntityTag;
use fleet_reconcile::{
    BackoffPolicy, RetryTracker, SpecHash, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{CancelToken, WorkerError};
use crate::domain::{Desired, Domain, DomainError};

/// Default bound on cleanup after a reconciler stops.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconciler tuning shared by every reconciler of a tree.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay between retries of transient failures.
    pub backoff: BackoffPolicy,

    /// Transient failures tolerated within `retry_window` before failing.
    pub max_retries: u32,

    pub retry_window: Duration,

    /// Upper bound on cleanup.
    pub cleanup_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}

/// Outcome of one convergence pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Converged, or nothing to do.
    Idle,
    /// The entity is terminal; stop.
    Terminal,
}

/// Drives one entity toward its desired state until cancelled.
pub struct EntityReconciler<D: Domain> {
    entity: EntityTag,
    key: String,
    domain: Arc<D>,
    config: ReconcilerConfig,
    nudges: mpsc::Receiver<()>,
    token: CancelToken,
    last_applied: Option<SpecHash>,
    retries: RetryTracker,
}

impl<D: Domain> EntityReconciler<D> {
    pub fn new(
        entity: EntityTag,
        domain: Arc<D>,
        config: ReconcilerConfig,
        nudges: mpsc::Receiver<()>,
        token: CancelToken,
    ) -> Self {
        let retries = RetryTracker::new(config.max_retries, config.retry_window);
        Self {
            key: entity.to_string(),
            entity,
            domain,
            config,
            nudges,
            token,
            last_applied: None,
            retries,
        }
    }

    pub fn entity(&self) -> &EntityTag {
        &self.entity
    }

    /// Run until cancelled, terminal, or failed; then clean up.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(entity = %self.entity, domain = self.domain.name(), "Reconciler started");
        let result = self.converge().await;
        if let Err(e) = &result {
            error!(entity = %self.entity, error = %e, "Reconciler failed");
        }
        self.cleanup().await;
        info!(entity = %self.entity, "Reconciler stopped");
        result
    }

    async fn converge(&mut self) -> Result<(), WorkerError> {
        let token = self.token.clone();
        let mut work = match token.run_until_cancelled(self.domain.work_signal(&self.entity)).await {
            None => return Ok(()),
            Some(work) => work.map_err(|e| self.failed(&e))?,
        };
        let mut retry_in: Option<Duration> = None;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(entity = %self.entity, "Reconciler cancelled");
                    return Ok(());
                }
                signal = work.next() => {
                    if let Err(e) = signal {
                        warn!(entity = %self.entity, error = %e, "Work signal ended");
                        return Err(e.into());
                    }
                }
                Some(()) = self.nudges.recv() => {
                    debug!(entity = %self.entity, "Nudged");
                }
                _ = tokio::time::sleep(retry_in.unwrap_or_default()), if retry_in.is_some() => {
                    debug!(entity = %self.entity, "Retrying after backoff");
                }
            }

            let pass = match token.run_until_cancelled(self.pass()).await {
                None => return Ok(()),
                Some(pass) => pass,
            };
            retry_in = None;
            match pass {
                Ok(Pass::Idle) => self.retries.clear(&self.key),
                Ok(Pass::Terminal) => {
                    info!(entity = %self.entity, "Entity is terminal, reconciler exiting");
                    return Ok(());
                }
                Err(DomainError::NotFound(what)) => {
                    info!(entity = %self.entity, what = %what, "Entity gone, reconciler exiting");
                    return Ok(());
                }
                Err(e @ DomainError::Transient(_)) => {
                    if self.retries.record_failure(&self.key) {
                        return Err(self.failed(&e));
                    }
                    let attempt = self.retries.failures(&self.key).saturating_sub(1);
                    let delay = self.config.backoff.delay(attempt);
                    warn!(
                        entity = %self.entity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconcile failed, will retry"
                    );
                    retry_in = Some(delay);
                }
                Err(e @ DomainError::Permanent(_)) => return Err(self.failed(&e)),
            }
        }
    }

    /// One convergence pass.
    async fn pass(&mut self) -> Result<Pass, DomainError> {
        let desired = match self.domain.desired_state(&self.entity, &self.token).await? {
            Desired::State(state) => state,
            Desired::Terminal => return Ok(Pass::Terminal),
        };
        let hash = SpecHash::of(&desired).map_err(|e| DomainError::Permanent(e.to_string()))?;
        if self.last_applied.as_ref() == Some(&hash) {
            debug!(entity = %self.entity, hash = %hash, "Desired state unchanged");
            return Ok(Pass::Idle);
        }

        let observed = self.domain.observed_state(&self.entity, &self.token).await?;
        if observed.as_ref() == Some(&desired) {
            debug!(entity = %self.entity, "Observed state already matches");
        } else {
            self.domain
                .reconcile(&self.entity, &desired, &self.token)
                .await?;
            info!(entity = %self.entity, hash = %hash, "Entity reconciled");
        }
        self.last_applied = Some(hash);
        Ok(Pass::Idle)
    }

    async fn cleanup(&self) {
        let token = CancelToken::new();
        let timeout = self.config.cleanup_timeout;
        match tokio::time::timeout(timeout, self.domain.cleanup(&self.entity, &token)).await {
            Ok(Ok(())) => debug!(entity = %self.entity, "Cleanup complete"),
            Ok(Err(e)) => warn!(entity = %self.entity, error = %e, "Cleanup failed"),
            Err(_) => {
                token.cancel();
                warn!(
                    entity = %self.entity,
                    timeout_ms = timeout.as_millis() as u64,
                    "Cleanup timed out"
                );
            }
        }
    }

    fn failed(&self, err: &DomainError) -> WorkerError {
        WorkerError::Reconciler {
            entity: self.entity.to_string(),
            message: err.to_string(),
        }
    }
}
