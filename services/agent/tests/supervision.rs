//! Supervision tree behaviour against a recording domain.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_agent::domain::{Desired, Domain, DomainError};
use fleet_agent::supervision::{
    CancelToken, EntityPhase, FeedSemantics, ReconcilerConfig, SupervisionTree, TreeConfig,
    TreePhase, TreeStatus, WorkerError,
};
use fleet_id::EntityTag;
use fleet_reconcile::BackoffPolicy;
use fleet_txn::{channel_feed, notify_channel, NotifyFeed};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Started(String),
    Desired(String),
    Reconciled(String),
    Cleanup(String),
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Permanent,
    Panic,
}

/// Records every domain call; cleanup blocks until the gate opens.
struct Recording {
    events: mpsc::UnboundedSender<Event>,
    signals: Mutex<Vec<mpsc::Sender<()>>>,
    gate: watch::Receiver<bool>,
    failures: Mutex<BTreeMap<String, Failure>>,
}

impl Recording {
    fn new(gate_open: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>, watch::Sender<bool>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (gate_tx, gate) = watch::channel(gate_open);
        let domain = Arc::new(Self {
            events,
            signals: Mutex::new(Vec::new()),
            gate,
            failures: Mutex::new(BTreeMap::new()),
        });
        (domain, rx, gate_tx)
    }

    fn fail(&self, entity: &str, failure: Failure) {
        self.failures
            .lock()
            .unwrap()
            .insert(entity.to_string(), failure);
    }

    fn record(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Domain for Recording {
    type State = String;

    fn name(&self) -> &str {
        "recording"
    }

    async fn work_signal(&self, entity: &EntityTag) -> Result<Box<dyn NotifyFeed>, DomainError> {
        let (tx, feed) = notify_channel(1);
        tx.try_send(()).unwrap();
        self.signals.lock().unwrap().push(tx);
        self.record(Event::Started(entity.to_string()));
        Ok(Box::new(feed))
    }

    async fn desired_state(
        &self,
        entity: &EntityTag,
        _: &CancelToken,
    ) -> Result<Desired<String>, DomainError> {
        self.record(Event::Desired(entity.to_string()));
        Ok(Desired::State(entity.to_string()))
    }

    async fn observed_state(
        &self,
        _: &EntityTag,
        _: &CancelToken,
    ) -> Result<Option<String>, DomainError> {
        Ok(None)
    }

    async fn reconcile(
        &self,
        entity: &EntityTag,
        _: &String,
        _: &CancelToken,
    ) -> Result<(), DomainError> {
        let failure = self.failures.lock().unwrap().get(&entity.to_string()).copied();
        match failure {
            Some(Failure::Permanent) => Err(DomainError::Permanent("boom".into())),
            Some(Failure::Panic) => panic!("reconcile panicked"),
            None => {
                self.record(Event::Reconciled(entity.to_string()));
                Ok(())
            }
        }
    }

    async fn cleanup(&self, entity: &EntityTag, _: &CancelToken) -> Result<(), DomainError> {
        let mut gate = self.gate.clone();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        self.record(Event::Cleanup(entity.to_string()));
        Ok(())
    }
}

fn config(semantics: FeedSemantics, grace: Duration, cleanup: Duration) -> TreeConfig {
    TreeConfig {
        semantics,
        shutdown_grace: grace,
        reconciler: ReconcilerConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(10),
                jitter: 0.0,
            },
            cleanup_timeout: cleanup,
            ..ReconcilerConfig::default()
        },
    }
}

fn snapshot() -> TreeConfig {
    config(
        FeedSemantics::Snapshot,
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn tag(s: &str) -> EntityTag {
    EntityTag::parse(s).unwrap()
}

async fn until(
    status: &mut watch::Receiver<TreeStatus>,
    what: &str,
    pred: impl Fn(&TreeStatus) -> bool,
) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pred(&status.borrow_and_update()) {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
    assert!(pred(&status.borrow()), "tree ended before {what}");
}

async fn expect_event(events: &mut mpsc::UnboundedReceiver<Event>, want: Event) {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event == want {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "never saw {want:?}");
}

fn drain(events: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn running(status: &TreeStatus, names: &[&str]) -> bool {
    status.entities == names.iter().map(|n| (tag(n), EntityPhase::Running)).collect()
}

#[tokio::test]
async fn test_reconciler_lifecycle_follows_feed() {
    let (tx, feed) = channel_feed(8);
    let (domain, mut events, _gate) = Recording::new(true);
    let (tree, mut status) = SupervisionTree::new(feed, domain, snapshot()).spawn();

    tx.send(ids(&["machine-0"])).await.unwrap();
    until(&mut status, "A running", |s| running(s, &["machine-0"])).await;
    expect_event(&mut events, Event::Reconciled("machine-0".into())).await;

    tx.send(ids(&["machine-0", "machine-1"])).await.unwrap();
    until(&mut status, "A and B running", |s| {
        running(s, &["machine-0", "machine-1"])
    })
    .await;
    expect_event(&mut events, Event::Reconciled("machine-1".into())).await;

    tx.send(ids(&["machine-1"])).await.unwrap();
    until(&mut status, "A torn down", |s| running(s, &["machine-1"])).await;
    expect_event(&mut events, Event::Cleanup("machine-0".into())).await;
    assert!(!tree.is_finished());
    assert!(!drain(&mut events).contains(&Event::Cleanup("machine-1".into())));

    tree.cancel();
    assert_eq!(tree.wait().await, Ok(()));
    let last = status.borrow().clone();
    assert_eq!(last.phase, TreePhase::Dead);
    assert!(last.entities.is_empty());
}

#[tokio::test]
async fn test_feed_close_collapses_tree_after_children_complete() {
    let (tx, feed) = channel_feed(8);
    let (domain, mut events, gate) = Recording::new(false);
    let (tree, mut status) = SupervisionTree::new(feed, domain, snapshot()).spawn();

    tx.send(ids(&["machine-0", "machine-1"])).await.unwrap();
    expect_event(&mut events, Event::Reconciled("machine-0".into())).await;
    expect_event(&mut events, Event::Reconciled("machine-1".into())).await;

    drop(tx);
    until(&mut status, "tree dying", |s| s.phase == TreePhase::Dying).await;
    assert!(status
        .borrow()
        .entities
        .values()
        .all(|phase| *phase == EntityPhase::Stopping));

    // Cleanup is held; the tree must not report before both children end.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!tree.is_finished());
    assert_eq!(status.borrow().phase, TreePhase::Dying);

    gate.send_replace(true);
    assert_eq!(tree.wait().await, Err(WorkerError::FeedClosed));

    let cleaned: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, Event::Cleanup(_)))
        .collect();
    assert_eq!(cleaned.len(), 2);
    assert_eq!(status.borrow().phase, TreePhase::Dead);
}

#[tokio::test]
async fn test_reappearing_entity_restarts_after_completion() {
    let (tx, feed) = channel_feed(8);
    let (domain, mut events, gate) = Recording::new(false);
    let (tree, mut status) = SupervisionTree::new(feed, domain, snapshot()).spawn();

    tx.send(ids(&["machine-0"])).await.unwrap();
    expect_event(&mut events, Event::Started("machine-0".into())).await;

    tx.send(ids(&[])).await.unwrap();
    until(&mut status, "A stopping", |s| {
        s.entities.get(&tag("machine-0")) == Some(&EntityPhase::Stopping)
    })
    .await;

    // Back while the old reconciler is still cleaning up.
    tx.send(ids(&["machine-0"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!drain(&mut events).contains(&Event::Started("machine-0".into())));
    assert_eq!(
        status.borrow().entities.get(&tag("machine-0")),
        Some(&EntityPhase::Stopping)
    );

    gate.send_replace(true);
    expect_event(&mut events, Event::Cleanup("machine-0".into())).await;
    expect_event(&mut events, Event::Started("machine-0".into())).await;
    until(&mut status, "A running again", |s| running(s, &["machine-0"])).await;

    tree.cancel();
    assert_eq!(tree.wait().await, Ok(()));
}

#[tokio::test]
async fn test_unparseable_ids_are_skipped() {
    let (tx, feed) = channel_feed(8);
    let (domain, _events, _gate) = Recording::new(true);
    let (tree, mut status) = SupervisionTree::new(feed, domain, snapshot()).spawn();

    tx.send(ids(&["bogus", "machine-0", "machine-"])).await.unwrap();
    until(&mut status, "A running", |s| running(s, &["machine-0"])).await;

    tree.cancel();
    assert_eq!(tree.wait().await, Ok(()));
}

#[tokio::test]
async fn test_failing_reconciler_takes_down_siblings() {
    let (tx, feed) = channel_feed(8);
    let (domain, mut events, _gate) = Recording::new(true);
    domain.fail("machine-9", Failure::Permanent);
    let (tree, _status) = SupervisionTree::new(feed, domain, snapshot()).spawn();

    tx.send(ids(&["machine-0"])).await.unwrap();
    expect_event(&mut events, Event::Reconciled("machine-0".into())).await;
    tx.send(ids(&["machine-0", "machine-9"])).await.unwrap();

    assert_eq!(
        tree.wait().await,
        Err(WorkerError::Reconciler {
            entity: "machine-9".into(),
            message: "permanent error: boom".into(),
        })
    );
    expect_event(&mut events, Event::Cleanup("machine-0".into())).await;
}

#[tokio::test]
async fn test_panicking_reconciler_is_reported() {
    let (tx, feed) = channel_feed(8);
    let (domain, _events, _gate) = Recording::new(true);
    domain.fail("machine-3", Failure::Panic);
    let (tree, _status) = SupervisionTree::new(feed, domain, snapshot()).spawn();

    tx.send(ids(&["machine-3"])).await.unwrap();
    assert_eq!(
        tree.wait().await,
        Err(WorkerError::Panicked("reconciler machine-3".into()))
    );
}

#[tokio::test]
async fn test_incremental_batches_nudge_known_entities() {
    let (tx, feed) = channel_feed(8);
    let (domain, mut events, _gate) = Recording::new(true);
    let semantics = config(
        FeedSemantics::Incremental,
        Duration::from_secs(5),
        Duration::from_secs(5),
    );
    let (tree, mut status) = SupervisionTree::new(feed, domain, semantics).spawn();

    tx.send(ids(&["machine-0"])).await.unwrap();
    expect_event(&mut events, Event::Reconciled("machine-0".into())).await;

    // Known id: nudged, re-reads desired state, nothing new to apply.
    tx.send(ids(&["machine-0"])).await.unwrap();
    expect_event(&mut events, Event::Desired("machine-0".into())).await;

    // Absent ids are not stopped.
    tx.send(ids(&["machine-1"])).await.unwrap();
    until(&mut status, "A and B running", |s| {
        running(s, &["machine-0", "machine-1"])
    })
    .await;
    let seen = drain(&mut events);
    assert_eq!(
        seen.iter()
            .filter(|e| **e == Event::Reconciled("machine-0".into()))
            .count(),
        0
    );

    tree.cancel();
    assert_eq!(tree.wait().await, Ok(()));
}

#[tokio::test]
async fn test_stuck_children_are_aborted_after_grace() {
    let (tx, feed) = channel_feed(8);
    let (domain, mut events, _gate) = Recording::new(false);
    let stuck = config(
        FeedSemantics::Snapshot,
        Duration::from_millis(100),
        Duration::from_secs(60),
    );
    let (tree, status) = SupervisionTree::new(feed, domain, stuck).spawn();

    tx.send(ids(&["machine-0", "machine-1"])).await.unwrap();
    expect_event(&mut events, Event::Reconciled("machine-0".into())).await;
    expect_event(&mut events, Event::Reconciled("machine-1".into())).await;

    tree.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), tree.wait()).await;
    assert_eq!(result, Ok(Ok(())));
    assert_eq!(status.borrow().phase, TreePhase::Dead);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, Event::Cleanup(_))));
}
