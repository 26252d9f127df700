//! The profile domain driven end to end through a supervision tree.

use std::sync::Arc;
use std::time::Duration;

use fleet_agent::bootstrap::ensure_model;
use fleet_agent::domain::{MockBroker, ProfileDomain, Traced};
use fleet_agent::supervision::{EntityPhase, SupervisionTree, TreeConfig, TreeStatus};
use fleet_id::{EntityTag, ModelUuid};
use fleet_ports::{ports_global_key, PortRange, PortsState, Protocol, OPENED_PORTS};
use fleet_txn::{
    Assert, LiveEntitiesFeed, MemoryStore, Op, SqliteStore, Store, MACHINES, UNITS,
};
use rstest::rstest;
use serde_json::json;
use tokio::sync::watch;

fn memory() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

fn sqlite() -> Arc<dyn Store> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

async fn seed(store: &Arc<dyn Store>) -> ModelUuid {
    let model = ModelUuid::new();
    ensure_model(store.as_ref(), model).await.unwrap();
    store
        .apply(&[
            Op::insert(
                MACHINES,
                model.doc_id("0"),
                json!({ "life": "alive", "profiles": ["gpu"] }),
            ),
            Op::insert(MACHINES, model.doc_id("1"), json!({ "life": "alive" })),
            Op::insert(
                UNITS,
                model.doc_id("web/0"),
                json!({ "life": "alive", "machine-id": "1" }),
            ),
        ])
        .await
        .unwrap();
    model
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn until(status: &mut watch::Receiver<TreeStatus>, pred: impl Fn(&TreeStatus) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred(&status.borrow_and_update()) {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
}

/// Wait until the machine document records `profiles` as applied.
async fn recorded(store: &Arc<dyn Store>, doc_id: &str, profiles: &[String]) {
    let want = json!(profiles);
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let doc = store.find(MACHINES, doc_id).await.unwrap().unwrap();
            if doc.body.get("applied-profiles") == Some(&want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(found.is_ok(), "{doc_id} never recorded {want}");
}

fn machine(id: &str) -> EntityTag {
    EntityTag::parse(&format!("machine-{id}")).unwrap()
}

#[rstest]
#[case::memory(memory())]
#[case::sqlite(sqlite())]
#[tokio::test]
async fn test_profiles_follow_machine_documents(#[case] store: Arc<dyn Store>) {
    let model = seed(&store).await;
    let broker = Arc::new(MockBroker::new());
    let domain = Arc::new(Traced::new(ProfileDomain::new(
        store.clone(),
        model,
        broker.clone(),
    )));
    let base = vec!["default".to_string(), format!("fleet-{model}")];

    let feed = LiveEntitiesFeed::new(store.clone(), MACHINES);
    let (tree, mut status) = SupervisionTree::new(feed, domain, TreeConfig::default()).spawn();

    let mut with_gpu = base.clone();
    with_gpu.push("gpu".into());
    eventually("machine 0 profiles", || broker.applied("0") == Some(with_gpu.clone())).await;
    eventually("machine 1 profiles", || broker.applied("1") == Some(base.clone())).await;

    recorded(&store, &model.doc_id("0"), &with_gpu).await;

    // A change to the machine document is picked up by its reconciler.
    store
        .apply(&[Op::set(
            MACHINES,
            model.doc_id("0"),
            Assert::DocExists,
            json!({ "profiles": ["gpu", "cuda"] }),
        )])
        .await
        .unwrap();
    let mut with_cuda = with_gpu.clone();
    with_cuda.push("cuda".into());
    eventually("machine 0 updated", || broker.applied("0") == Some(with_cuda.clone())).await;
    let applies = broker.apply_count();

    // Recording applied profiles does not trigger another apply.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.apply_count(), applies);

    // A machine that dies has its reconciler stopped and its state released.
    let ports = PortsState::new(store.clone(), model);
    let mut opened = ports.get_or_create_ports("1", "").await.unwrap();
    opened
        .open_ports(PortRange::new("web/0", 80, 80, Protocol::Tcp).unwrap())
        .await
        .unwrap();
    store
        .apply(&[Op::set(
            MACHINES,
            model.doc_id("1"),
            Assert::DocExists,
            json!({ "life": "dead" }),
        )])
        .await
        .unwrap();

    until(&mut status, |s| !s.entities.contains_key(&machine("1"))).await;
    assert_eq!(broker.applied("1"), None);
    let ports_doc = model.doc_id(&ports_global_key("1", ""));
    assert!(store.find(OPENED_PORTS, &ports_doc).await.unwrap().is_none());
    assert_eq!(
        status.borrow().entities.get(&machine("0")),
        Some(&EntityPhase::Running)
    );

    tree.cancel();
    assert_eq!(tree.wait().await, Ok(()));
    // Stopping the agent leaves live machines configured.
    assert_eq!(broker.applied("0"), Some(with_cuda));
}

#[tokio::test]
async fn test_transient_broker_failures_are_retried() {
    let store = memory();
    let model = seed(&store).await;
    let broker = Arc::new(MockBroker::new());
    broker.fail_next(2);
    let domain = Arc::new(ProfileDomain::new(store.clone(), model, broker.clone()));

    let mut config = TreeConfig::default();
    config.reconciler.backoff.base = Duration::from_millis(1);
    config.reconciler.backoff.jitter = 0.0;
    let feed = LiveEntitiesFeed::new(store.clone(), MACHINES);
    let (tree, _status) = SupervisionTree::new(feed, domain, config).spawn();

    eventually("both machines configured", || {
        broker.applied("0").is_some() && broker.applied("1").is_some()
    })
    .await;
    assert!(!tree.is_finished());

    tree.cancel();
    assert_eq!(tree.wait().await, Ok(()));
}

#[tokio::test]
async fn test_applied_profiles_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let model;
    {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&path).unwrap());
        model = seed(&store).await;
        let broker = Arc::new(MockBroker::new());
        let domain = Arc::new(ProfileDomain::new(store.clone(), model, broker.clone()));
        let feed = LiveEntitiesFeed::new(store.clone(), MACHINES);
        let (tree, _status) =
            SupervisionTree::new(feed, domain, TreeConfig::default()).spawn();

        eventually("machine 1 configured", || broker.applied("1").is_some()).await;
        let base = vec!["default".to_string(), format!("fleet-{model}")];
        recorded(&store, &model.doc_id("1"), &base).await;

        tree.cancel();
        tree.wait().await.unwrap();
    }

    let reopened = SqliteStore::open(&path).unwrap();
    assert!(!ensure_model(&reopened, model).await.unwrap());
    let doc = reopened
        .find(MACHINES, &model.doc_id("1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        doc.body["applied-profiles"],
        json!(["default", format!("fleet-{model}")])
    );
}
