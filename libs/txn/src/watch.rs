//! Change feeds over the store.
//!
//! Two feed shapes are consumed by supervisors and reconcilers:
//!
//! - [`ChangeFeed`]: batches of identifiers (set-valued)
//! - [`NotifyFeed`]: a bare "something changed" signal (single-valued)
//!
//! Both are infinite. A feed whose source goes away returns
//! [`FeedError::Closed`] from then on; consumers must treat that as fatal
//! rather than as an empty batch.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::life::Life;
use crate::op::DocChange;
use crate::store::Store;

/// Errors surfaced by change feeds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The underlying subscription terminated.
    #[error("change feed closed")]
    Closed,

    /// The feed could not read the state it reports on.
    #[error("change feed failed: {0}")]
    Failed(String),
}

/// Set-valued feed of changed identifiers.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Wait for the next batch.
    async fn next(&mut self) -> Result<Vec<String>, FeedError>;
}

/// Single-valued change signal.
#[async_trait]
pub trait NotifyFeed: Send {
    /// Wait for the next signal.
    async fn next(&mut self) -> Result<(), FeedError>;
}

#[async_trait]
impl<T: ChangeFeed + ?Sized> ChangeFeed for Box<T> {
    async fn next(&mut self) -> Result<Vec<String>, FeedError> {
        (**self).next().await
    }
}

#[async_trait]
impl<T: NotifyFeed + ?Sized> NotifyFeed for Box<T> {
    async fn next(&mut self) -> Result<(), FeedError> {
        (**self).next().await
    }
}

// =============================================================================
// Channel Feeds
// =============================================================================

/// Feed driven by an mpsc channel; closes when every sender is dropped.
pub struct ChannelFeed {
    rx: mpsc::Receiver<Vec<String>>,
}

/// Create a channel-backed [`ChangeFeed`].
pub fn channel_feed(buffer: usize) -> (mpsc::Sender<Vec<String>>, ChannelFeed) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, ChannelFeed { rx })
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    async fn next(&mut self) -> Result<Vec<String>, FeedError> {
        self.rx.recv().await.ok_or(FeedError::Closed)
    }
}

/// Signal feed driven by an mpsc channel; closes when every sender is dropped.
pub struct ChannelNotifyFeed {
    rx: mpsc::Receiver<()>,
}

/// Create a channel-backed [`NotifyFeed`].
pub fn notify_channel(buffer: usize) -> (mpsc::Sender<()>, ChannelNotifyFeed) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, ChannelNotifyFeed { rx })
}

#[async_trait]
impl NotifyFeed for ChannelNotifyFeed {
    async fn next(&mut self) -> Result<(), FeedError> {
        self.rx.recv().await.ok_or(FeedError::Closed)?;
        // Coalesce a burst into one signal.
        while self.rx.try_recv().is_ok() {}
        Ok(())
    }
}

// =============================================================================
// Store Feeds
// =============================================================================

enum Wake {
    /// Ids of matching documents, in order of first appearance.
    Changed(Vec<String>),
    /// The receiver fell behind; the caller must resynchronize.
    Lagged,
}

/// Block until at least one matching change arrives, then drain whatever else
/// is already queued.
async fn wait_matching(
    rx: &mut broadcast::Receiver<DocChange>,
    matches: impl Fn(&DocChange) -> bool,
) -> Result<Wake, FeedError> {
    let mut ids: Vec<String> = Vec::new();
    let push = |ids: &mut Vec<String>, change: DocChange| {
        if matches(&change) && !ids.contains(&change.id) {
            ids.push(change.id);
        }
    };

    while ids.is_empty() {
        match rx.recv().await {
            Ok(change) => push(&mut ids, change),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Change feed lagged, resynchronizing");
                return Ok(Wake::Lagged);
            }
            Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
        }
    }

    loop {
        match rx.try_recv() {
            Ok(change) => push(&mut ids, change),
            Err(broadcast::error::TryRecvError::Empty) => break,
            Err(broadcast::error::TryRecvError::Lagged(_)) => return Ok(Wake::Lagged),
            Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }
    Ok(Wake::Changed(ids))
}

async fn collection_ids(
    store: &dyn Store,
    collection: &str,
    keep: impl Fn(&serde_json::Value) -> bool,
) -> Result<Vec<String>, FeedError> {
    let docs = store
        .find_all(collection)
        .await
        .map_err(|e| FeedError::Failed(e.to_string()))?;
    Ok(docs
        .into_iter()
        .filter(|(_, doc)| keep(&doc.body))
        .map(|(id, _)| id)
        .collect())
}

/// Ids of changed documents in one collection.
///
/// The first batch lists every document currently in the collection.
/// Dropping a pending `next()` loses nothing: a full read that was started is
/// owed until a batch is emitted.
pub struct CollectionFeed {
    store: Arc<dyn Store>,
    collection: String,
    rx: broadcast::Receiver<DocChange>,
    resync: bool,
}

impl CollectionFeed {
    /// Subscribe to a collection. Changes committed after this call are not missed.
    pub fn new(store: Arc<dyn Store>, collection: &str) -> Self {
        let rx = store.subscribe();
        Self {
            store,
            collection: collection.to_string(),
            rx,
            resync: true,
        }
    }
}

#[async_trait]
impl ChangeFeed for CollectionFeed {
    async fn next(&mut self) -> Result<Vec<String>, FeedError> {
        if !self.resync {
            let collection = self.collection.clone();
            match wait_matching(&mut self.rx, |c| c.collection == collection).await? {
                Wake::Changed(ids) => {
                    debug!(collection = %self.collection, count = ids.len(), "Collection changed");
                    return Ok(ids);
                }
                Wake::Lagged => self.resync = true,
            }
        }

        // Every id, including ones that may have gone; receivers re-read.
        let mut ids = collection_ids(self.store.as_ref(), &self.collection, |_| true).await?;
        ids.sort();
        self.resync = false;
        Ok(ids)
    }
}

/// Snapshot of every non-dead entity in a collection.
///
/// Emits the full live set initially and again whenever it differs from the
/// previously emitted set. A change consumed by a dropped `next()` is still
/// re-read by the following call.
pub struct LiveEntitiesFeed {
    store: Arc<dyn Store>,
    collection: String,
    rx: broadcast::Receiver<DocChange>,
    last: Option<BTreeSet<String>>,
    stale: bool,
}

impl LiveEntitiesFeed {
    /// Subscribe to a collection of entity documents.
    pub fn new(store: Arc<dyn Store>, collection: &str) -> Self {
        let rx = store.subscribe();
        Self {
            store,
            collection: collection.to_string(),
            rx,
            last: None,
            stale: true,
        }
    }

    async fn live_set(&self) -> Result<BTreeSet<String>, FeedError> {
        let ids = collection_ids(self.store.as_ref(), &self.collection, |body| {
            !Life::of(body).is_dead()
        })
        .await?;
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl ChangeFeed for LiveEntitiesFeed {
    async fn next(&mut self) -> Result<Vec<String>, FeedError> {
        loop {
            if !self.stale {
                let collection = self.collection.clone();
                wait_matching(&mut self.rx, |c| c.collection == collection).await?;
                self.stale = true;
            }

            let live = self.live_set().await?;
            self.stale = false;
            if self.last.as_ref() != Some(&live) {
                self.last = Some(live.clone());
                return Ok(live.into_iter().collect());
            }
        }
    }
}

/// Signal fired whenever one document changes (including removal).
///
/// The first signal is immediate so the consumer does its initial pass.
pub struct DocumentFeed {
    collection: String,
    id: String,
    rx: broadcast::Receiver<DocChange>,
    initial: bool,
}

impl DocumentFeed {
    /// Subscribe to one document.
    pub fn new(store: &dyn Store, collection: &str, id: &str) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            rx: store.subscribe(),
            initial: true,
        }
    }
}

#[async_trait]
impl NotifyFeed for DocumentFeed {
    async fn next(&mut self) -> Result<(), FeedError> {
        if std::mem::take(&mut self.initial) {
            return Ok(());
        }
        let (collection, id) = (self.collection.clone(), self.id.clone());
        // Lagged or changed both mean "look again".
        wait_matching(&mut self.rx, |c| c.collection == collection && c.id == id).await?;
        Ok(())
    }
}
