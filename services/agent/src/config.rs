//! Configuration for the fleet agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fleet_id::ModelUuid;
use fleet_txn::DEFAULT_MAX_ATTEMPTS;

use crate::supervision::{
    FeedSemantics, ReconcilerConfig, RestartPolicy, TreeConfig, WorkerError,
    DEFAULT_CLEANUP_TIMEOUT, DEFAULT_SHUTDOWN_GRACE,
};

/// Where documents are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// SQLite file under the data directory.
    Sqlite,
    /// Process memory; lost on exit.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(WorkerError::InvalidConfig(format!(
                "unknown store backend {other:?}"
            ))),
        }
    }
}

/// Fleet agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model whose machines this agent reconciles.
    pub model_uuid: ModelUuid,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    pub store_backend: StoreBackend,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Attempts per optimistic transaction.
    pub txn_max_attempts: u32,

    /// Upper bound on a reconciler's cleanup.
    pub cleanup_timeout: Duration,

    /// Time reconcilers get to stop before they are aborted.
    pub shutdown_grace: Duration,

    pub feed_semantics: FeedSemantics,

    /// Tree restarts tolerated within the restart window.
    pub max_restarts: u32,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let model_uuid = match lookup("FLEET_MODEL_UUID") {
            Some(s) => s
                .parse()
                .with_context(|| format!("invalid FLEET_MODEL_UUID {s:?}"))?,
            None => ModelUuid::new(),
        };

        let data_dir = lookup("FLEET_DATA_DIR")
            .unwrap_or_else(|| "/var/lib/fleet".to_string())
            .into();

        let store_backend = lookup("FLEET_STORE")
            .map(|s| s.parse::<StoreBackend>())
            .transpose()?
            .unwrap_or(StoreBackend::Sqlite);

        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let txn_max_attempts = parse_or(&lookup, "FLEET_TXN_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;

        let cleanup_timeout = Duration::from_secs(parse_or(
            &lookup,
            "FLEET_CLEANUP_TIMEOUT_SECS",
            DEFAULT_CLEANUP_TIMEOUT.as_secs(),
        )?);

        let shutdown_grace = Duration::from_secs(parse_or(
            &lookup,
            "FLEET_SHUTDOWN_GRACE_SECS",
            DEFAULT_SHUTDOWN_GRACE.as_secs(),
        )?);

        let feed_semantics = lookup("FLEET_FEED_SEMANTICS")
            .map(|s| s.parse::<FeedSemantics>())
            .transpose()?
            .unwrap_or_default();

        let max_restarts = parse_or(
            &lookup,
            "FLEET_MAX_RESTARTS",
            RestartPolicy::default().max_restarts,
        )?;

        Ok(Self {
            model_uuid,
            data_dir,
            store_backend,
            log_level,
            txn_max_attempts,
            cleanup_timeout,
            shutdown_grace,
            feed_semantics,
            max_restarts,
        })
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.txn_max_attempts == 0 {
            return Err(WorkerError::InvalidConfig(
                "FLEET_TXN_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.cleanup_timeout.is_zero() {
            return Err(WorkerError::InvalidConfig(
                "FLEET_CLEANUP_TIMEOUT_SECS must be positive".into(),
            ));
        }
        if self.store_backend == StoreBackend::Sqlite && self.data_dir.as_os_str().is_empty() {
            return Err(WorkerError::InvalidConfig(
                "FLEET_DATA_DIR is required for the sqlite store".into(),
            ));
        }
        Ok(())
    }

    /// Path of the SQLite database.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            semantics: self.feed_semantics,
            shutdown_grace: self.shutdown_grace,
            reconciler: ReconcilerConfig {
                cleanup_timeout: self.cleanup_timeout,
                ..ReconcilerConfig::default()
            },
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            ..RestartPolicy::default()
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match lookup(key) {
        Some(s) => s
            .parse()
            .map_err(|_| anyhow!("invalid {key} {s:?}")),
        None => Ok(default),
    }
}
