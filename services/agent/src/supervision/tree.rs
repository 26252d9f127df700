//! Supervision tree: one reconciler per live entity.
//!
//! The tree consumes a [`ChangeFeed`] of entity identifiers and keeps
//! exactly one [`EntityReconciler`] running for each live entity.
//!
//! ## Entity lifecycle
//!
//! ```text
//! unseen ──appears──> running ──absent from batch──> stopping ──completion──> gone
//!                                                       │
//!                                          reappears: restart queued,
//!                                          started after completion
//! ```
//!
//! ## Tree lifecycle
//!
//! ```text
//! running ──child failed / feed closed / stop requested──> dying ──all completions──> dead
//! ```
//!
//! While dying every child is cancelled; children still running after
//! `shutdown_grace` are aborted. The tree is dead only once every child's
//! completion has fired. The first error observed becomes the tree's error.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::EntityTag;
use fleet_txn::ChangeFeed;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::reconciler::{EntityReconciler, ReconcilerConfig};
use super::{CancelToken, TaskHandle, WorkerError};
use crate::domain::Domain;

/// Default time children get to stop before they are aborted.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How a feed batch relates to the set of live entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedSemantics {
    /// Each batch is the complete live set; absent entities are stopped.
    #[default]
    Snapshot,
    /// Each batch lists changed entities. Unknown ones start, known ones are
    /// nudged, and reconcilers end themselves once their entity is terminal.
    Incremental,
}

impl FromStr for FeedSemantics {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "snapshot" => Ok(FeedSemantics::Snapshot),
            "incremental" => Ok(FeedSemantics::Incremental),
            other => Err(WorkerError::InvalidConfig(format!(
                "unknown feed semantics {other:?}"
            ))),
        }
    }
}

/// Lifecycle of the tree itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreePhase {
    Running,
    Dying,
    Dead,
}

/// Lifecycle of one registered reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityPhase {
    Running,
    Stopping,
}

/// Snapshot of the tree published after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeStatus {
    pub phase: TreePhase,
    pub entities: BTreeMap<EntityTag, EntityPhase>,
    pub error: Option<WorkerError>,
}

impl TreeStatus {
    fn starting() -> Self {
        Self {
            phase: TreePhase::Running,
            entities: BTreeMap::new(),
            error: None,
        }
    }

    /// Entities whose reconciler is running and not stopping.
    pub fn running(&self) -> Vec<EntityTag> {
        self.entities
            .iter()
            .filter(|(_, phase)| **phase == EntityPhase::Running)
            .map(|(entity, _)| entity.clone())
            .collect()
    }
}

/// Tree configuration.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub semantics: FeedSemantics,

    /// Time children get to stop once the tree is dying.
    pub shutdown_grace: Duration,

    pub reconciler: ReconcilerConfig,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            semantics: FeedSemantics::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            reconciler: ReconcilerConfig::default(),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

struct Child {
    handle: TaskHandle,
    phase: EntityPhase,
    nudge: mpsc::Sender<()>,
    restart_queued: bool,
}

type Exit = BoxFuture<'static, (EntityTag, Result<(), WorkerError>)>;

/// Registered reconcilers plus their merged completion signals.
struct Registry<D: Domain> {
    domain: Arc<D>,
    config: ReconcilerConfig,
    children: BTreeMap<EntityTag, Child>,
    exits: FuturesUnordered<Exit>,
}

impl<D: Domain> Registry<D> {
    fn new(domain: Arc<D>, config: ReconcilerConfig) -> Self {
        Self {
            domain,
            config,
            children: BTreeMap::new(),
            exits: FuturesUnordered::new(),
        }
    }

    fn start(&mut self, entity: EntityTag) {
        let token = CancelToken::new();
        let (nudge, nudges) = mpsc::channel(1);
        let reconciler = EntityReconciler::new(
            entity.clone(),
            self.domain.clone(),
            self.config.clone(),
            nudges,
            token.clone(),
        );
        let handle = TaskHandle::spawn(format!("reconciler {entity}"), token, reconciler.run());

        let completion = handle.completion();
        let tag = entity.clone();
        self.exits.push(
            async move {
                let result = completion.wait().await;
                (tag, result)
            }
            .boxed(),
        );

        info!(entity = %entity, "Started reconciler");
        self.children.insert(
            entity,
            Child {
                handle,
                phase: EntityPhase::Running,
                nudge,
                restart_queued: false,
            },
        );
    }

    fn stop(&mut self, entity: &EntityTag) {
        if let Some(child) = self.children.get_mut(entity) {
            if child.phase == EntityPhase::Running {
                info!(entity = %entity, "Stopping reconciler");
                child.handle.cancel();
                child.phase = EntityPhase::Stopping;
            }
            child.restart_queued = false;
        }
    }

    /// Diff a feed batch against the registry.
    fn apply(&mut self, ids: Vec<String>, semantics: FeedSemantics) {
        let mut seen = BTreeSet::new();
        for raw in ids {
            match self.domain.entity_for(&raw) {
                Some(entity) => {
                    seen.insert(entity);
                }
                None => warn!(id = %raw, "Skipping unparseable entity id"),
            }
        }

        for entity in &seen {
            let Some(child) = self.children.get_mut(entity) else {
                self.start(entity.clone());
                continue;
            };
            match child.phase {
                EntityPhase::Stopping => {
                    debug!(entity = %entity, "Entity reappeared while stopping, restart queued");
                    child.restart_queued = true;
                }
                EntityPhase::Running if semantics == FeedSemantics::Incremental => {
                    // A full channel already holds a pending nudge.
                    let _ = child.nudge.try_send(());
                }
                EntityPhase::Running => {}
            }
        }

        if semantics == FeedSemantics::Snapshot {
            let gone: Vec<EntityTag> = self
                .children
                .keys()
                .filter(|entity| !seen.contains(*entity))
                .cloned()
                .collect();
            for entity in gone {
                self.stop(&entity);
            }
        }

        debug!(
            batch = seen.len(),
            registered = self.children.len(),
            "Applied entity batch"
        );
    }

    /// Record a reconciler's completion, restarting it if it was queued.
    fn exited(
        &mut self,
        entity: &EntityTag,
        result: Result<(), WorkerError>,
        accepting: bool,
    ) -> Result<(), WorkerError> {
        let queued = self
            .children
            .remove(entity)
            .is_some_and(|child| child.restart_queued);
        match result {
            Ok(()) => {
                info!(entity = %entity, "Reconciler finished");
                if queued && accepting {
                    self.start(entity.clone());
                }
                Ok(())
            }
            Err(e) => {
                error!(entity = %entity, error = %e, "Reconciler exited with error");
                Err(e)
            }
        }
    }

    fn cancel_all(&mut self) {
        for (entity, child) in self.children.iter_mut() {
            if child.phase == EntityPhase::Running {
                debug!(entity = %entity, "Cancelling reconciler");
            }
            child.handle.cancel();
            child.phase = EntityPhase::Stopping;
            child.restart_queued = false;
        }
    }

    fn abort_all(&self) {
        for child in self.children.values() {
            child.handle.abort();
        }
    }
}

// =============================================================================
// Supervision Tree
// =============================================================================

/// Keeps one reconciler per entity named by a change feed.
pub struct SupervisionTree<F, D: Domain> {
    feed: F,
    domain: Arc<D>,
    config: TreeConfig,
    token: CancelToken,
    status: watch::Sender<TreeStatus>,
}

impl<F, D> SupervisionTree<F, D>
where
    F: ChangeFeed + 'static,
    D: Domain,
{
    pub fn new(feed: F, domain: Arc<D>, config: TreeConfig) -> Self {
        let (status, _) = watch::channel(TreeStatus::starting());
        Self {
            feed,
            domain,
            config,
            token: CancelToken::new(),
            status,
        }
    }

    /// Token that asks the tree to stop.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn status(&self) -> watch::Receiver<TreeStatus> {
        self.status.subscribe()
    }

    /// Run the tree on its own task.
    pub fn spawn(self) -> (TaskHandle, watch::Receiver<TreeStatus>) {
        let status = self.status();
        let token = self.token();
        (TaskHandle::spawn("supervision tree", token, self.run()), status)
    }

    fn publish(&self, phase: TreePhase, registry: &Registry<D>, error: Option<&WorkerError>) {
        let entities = registry
            .children
            .iter()
            .map(|(entity, child)| (entity.clone(), child.phase))
            .collect();
        self.status.send_replace(TreeStatus {
            phase,
            entities,
            error: error.cloned(),
        });
    }

    /// Run until the feed closes, a reconciler fails, or the token is
    /// cancelled. Returns only after every reconciler has completed.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let mut registry = Registry::new(self.domain.clone(), self.config.reconciler.clone());
        let mut first_error: Option<WorkerError> = None;
        let semantics = self.config.semantics;
        info!(domain = self.domain.name(), ?semantics, "Supervision tree started");

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    info!("Supervision tree stop requested");
                    break;
                }
                Some((entity, result)) = registry.exits.next(), if !registry.exits.is_empty() => {
                    if let Err(e) = registry.exited(&entity, result, true) {
                        first_error = Some(e);
                        break;
                    }
                }
                batch = self.feed.next() => match batch {
                    Ok(ids) => registry.apply(ids, semantics),
                    Err(e) => {
                        error!(error = %e, "Entity feed failed");
                        first_error = Some(e.into());
                        break;
                    }
                },
            }
            self.publish(TreePhase::Running, &registry, None);
        }

        registry.cancel_all();
        self.publish(TreePhase::Dying, &registry, first_error.as_ref());
        info!(
            remaining = registry.children.len(),
            "Supervision tree dying, waiting for reconcilers"
        );

        let deadline = Instant::now() + self.config.shutdown_grace;
        let mut aborted = false;
        while !registry.exits.is_empty() {
            tokio::select! {
                Some((entity, result)) = registry.exits.next() => {
                    if let Err(e) = registry.exited(&entity, result, false) {
                        if aborted && e == WorkerError::Aborted {
                            debug!(entity = %entity, "Reconciler aborted after grace period");
                        } else if first_error.is_none() {
                            first_error = Some(e);
                        } else {
                            debug!(entity = %entity, error = %e, "Discarding later error");
                        }
                    }
                    self.publish(TreePhase::Dying, &registry, first_error.as_ref());
                }
                _ = tokio::time::sleep_until(deadline), if !aborted => {
                    warn!(
                        remaining = registry.children.len(),
                        "Shutdown grace elapsed, aborting reconcilers"
                    );
                    registry.abort_all();
                    aborted = true;
                }
            }
        }

        self.publish(TreePhase::Dead, &registry, first_error.as_ref());
        match first_error {
            None => {
                info!("Supervision tree stopped");
                Ok(())
            }
            Some(e) => {
                error!(error = %e, "Supervision tree died");
                Err(e)
            }
        }
    }
}
