//! Fleet Agent
//!
//! Runs one supervision tree over the live machines of a model. Each machine
//! gets a reconciler that keeps its profiles in line with its document.
//!
//! ## Lifecycle
//!
//! - **Tree**: restarted with backoff when it dies with an error, until the
//!   restart budget for the window is spent
//! - **Shutdown**: ctrl-c cancels the tree and waits for every reconciler

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use fleet_agent::bootstrap::ensure_model;
use fleet_agent::{
    AgentConfig, MockBroker, ProfileDomain, StoreBackend, SupervisionTree, Traced,
};
use fleet_txn::{LiveEntitiesFeed, MemoryStore, SqliteStore, Store, MACHINES};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TREE_KEY: &str = "machines";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AgentConfig::from_env()?;
    config.validate()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        model = %config.model_uuid,
        data_dir = %config.data_dir.display(),
        store = ?config.store_backend,
        semantics = ?config.feed_semantics,
        "Starting fleet agent"
    );

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Sqlite => {
            std::fs::create_dir_all(&config.data_dir).with_context(|| {
                format!("failed to create data dir {}", config.data_dir.display())
            })?;
            Arc::new(SqliteStore::open(config.store_path())?)
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    ensure_model(store.as_ref(), config.model_uuid).await?;

    let domain = Arc::new(Traced::new(
        ProfileDomain::new(store.clone(), config.model_uuid, Arc::new(MockBroker::new()))
            .with_max_attempts(config.txn_max_attempts),
    ));

    let policy = config.restart_policy();
    let mut restarts = policy.tracker();

    loop {
        let feed = LiveEntitiesFeed::new(store.clone(), MACHINES);
        let (tree, _status) =
            SupervisionTree::new(feed, domain.clone(), config.tree_config()).spawn();

        let mut stopping = false;
        let result = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                stopping = true;
                tree.cancel();
                tree.wait().await
            }
            result = tree.wait() => result,
        };

        let err = match result {
            Ok(()) => {
                info!("Supervision tree exited");
                break;
            }
            Err(e) if stopping => {
                warn!(error = %e, "Supervision tree reported an error during shutdown");
                break;
            }
            Err(e) => e,
        };

        if restarts.record_failure(TREE_KEY) {
            error!(error = %err, "Supervision tree restart budget exhausted");
            bail!("supervision tree failed too often: {err}");
        }
        let attempt = restarts.failures(TREE_KEY).saturating_sub(1);
        let delay = policy.backoff.delay(attempt);
        warn!(
            error = %err,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Supervision tree died, restarting"
        );

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Fleet agent shutdown complete");
    Ok(())
}
