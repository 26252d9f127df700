//! In-memory store for tests and single-process deployments.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::op::{DocChange, Op, StoredDoc};
use crate::store::{apply_ops, DocTable, Store, CHANGE_BUFFER};
use crate::StoreError;

type Key = (String, String);

#[derive(Default)]
struct Inner {
    docs: BTreeMap<Key, StoredDoc>,
    injected: VecDeque<StoreError>,
    commits: u64,
}

/// Staged writes over the live map; nothing is visible until `commit`.
struct Staged<'a> {
    docs: &'a mut BTreeMap<Key, StoredDoc>,
    writes: Vec<(Key, Option<StoredDoc>)>,
}

impl Staged<'_> {
    fn staged(&self, key: &Key) -> Option<&Option<StoredDoc>> {
        self.writes.iter().rev().find(|(k, _)| k == key).map(|(_, d)| d)
    }

    fn commit(self) {
        for (key, doc) in self.writes {
            match doc {
                Some(doc) => {
                    self.docs.insert(key, doc);
                }
                None => {
                    self.docs.remove(&key);
                }
            }
        }
    }
}

impl DocTable for Staged<'_> {
    fn get(&mut self, collection: &str, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        let key = (collection.to_string(), id.to_string());
        match self.staged(&key) {
            Some(doc) => Ok(doc.clone()),
            None => Ok(self.docs.get(&key).cloned()),
        }
    }

    fn put(&mut self, collection: &str, id: &str, doc: &StoredDoc) -> Result<(), StoreError> {
        self.writes
            .push(((collection.to_string(), id.to_string()), Some(doc.clone())));
        Ok(())
    }

    fn delete(&mut self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.writes
            .push(((collection.to_string(), id.to_string()), None));
        Ok(())
    }
}

/// Mutex-guarded document map implementing [`Store`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<DocChange>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Mutex::new(Inner::default()),
            changes,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Make the next `apply` fail with `err` without touching any document.
    pub fn inject_failure(&self, err: StoreError) {
        if let Ok(mut inner) = self.lock() {
            inner.injected.push_back(err);
        }
    }

    /// Number of transactions committed so far.
    pub fn commits(&self) -> u64 {
        self.lock().map_or(0, |inner| inner.commits)
    }

    /// Number of documents across all collections.
    pub fn len(&self) -> usize {
        self.lock().map_or(0, |inner| inner.docs.len())
    }

    /// Returns true if the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find(&self, collection: &str, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .docs
            .get(&(collection.to_string(), id.to_string()))
            .cloned())
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<(String, StoredDoc)>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .docs
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, id), doc)| (id.clone(), doc.clone()))
            .collect())
    }

    async fn apply(&self, ops: &[Op]) -> Result<(), StoreError> {
        let changes = {
            let mut inner = self.lock()?;
            if let Some(err) = inner.injected.pop_front() {
                return Err(err);
            }

            let mut staged = Staged {
                docs: &mut inner.docs,
                writes: Vec::new(),
            };
            let changes = apply_ops(&mut staged, ops)?;
            staged.commit();
            inner.commits += 1;
            changes
        };

        debug!(ops = ops.len(), changes = changes.len(), "Committed transaction");
        for change in changes {
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocChange> {
        self.changes.subscribe()
    }
}
