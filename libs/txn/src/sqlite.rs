//! SQLite-backed store.
//!
//! Documents live in a single `docs` table. Each `apply` runs inside one
//! SQLite transaction, so a failed assert or a crash mid-write leaves the
//! table as it was.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::broadcast;
use tracing::debug;

use crate::op::{DocChange, Op, StoredDoc};
use crate::store::{apply_ops, DocTable, Store, CHANGE_BUFFER};
use crate::StoreError;

struct SqliteTable<'a> {
    tx: &'a Transaction<'a>,
}

fn decode_body(collection: &str, id: &str, raw: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        collection: collection.to_string(),
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl DocTable for SqliteTable<'_> {
    fn get(&mut self, collection: &str, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        let row: Option<(i64, String)> = self
            .tx
            .query_row(
                "SELECT revno, body FROM docs WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(revno, raw)| {
            Ok(StoredDoc {
                revno,
                body: decode_body(collection, id, &raw)?,
            })
        })
        .transpose()
    }

    fn put(&mut self, collection: &str, id: &str, doc: &StoredDoc) -> Result<(), StoreError> {
        self.tx.execute(
            r#"
            INSERT INTO docs (collection, id, revno, body, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(collection, id) DO UPDATE SET
                revno = excluded.revno,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            params![collection, id, doc.revno, doc.body.to_string(), unix_now()],
        )?;
        Ok(())
    }

    fn delete(&mut self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM docs WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(())
    }
}

/// SQLite document store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<DocChange>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL journal, relaxed fsync
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS docs (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                revno INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );
            "#,
        )?;
        debug!("Document store schema initialized");

        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn find(&self, collection: &str, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        let conn = self.lock()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT revno, body FROM docs WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(revno, raw)| {
            Ok(StoredDoc {
                revno,
                body: decode_body(collection, id, &raw)?,
            })
        })
        .transpose()
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<(String, StoredDoc)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, revno, body FROM docs WHERE collection = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, revno, raw)| {
                let body = decode_body(collection, &id, &raw)?;
                Ok((id, StoredDoc { revno, body }))
            })
            .collect()
    }

    async fn apply(&self, ops: &[Op]) -> Result<(), StoreError> {
        let changes = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let changes = apply_ops(&mut SqliteTable { tx: &tx }, ops)?;
            tx.commit()?;
            changes
        };

        debug!(ops = ops.len(), changes = changes.len(), "Committed transaction");
        for change in changes {
            let _ = self.changes.send(change);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Assert;
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .apply(&[Op::insert("ports", "m#0#", json!({"ports": []}))])
            .await
            .unwrap();
        store
            .apply(&[Op::add_to_set(
                "ports",
                "m#0#",
                Assert::Revno(1),
                "ports",
                json!({"protocol": "tcp"}),
            )])
            .await
            .unwrap();

        let doc = store.find("ports", "m#0#").await.unwrap().unwrap();
        assert_eq!(doc.revno, 2);
        assert_eq!(doc.body["ports"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_abort_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .apply(&[
                Op::insert("ports", "m#0#", json!({})),
                Op::assert("machines", "0", Assert::NotDead),
            ])
            .await
            .unwrap_err();

        assert!(err.is_aborted());
        assert!(store.find("ports", "m#0#").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .apply(&[Op::insert("machines", "0", json!({"life": "alive"}))])
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let all = store.find_all("machines").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "0");
    }
}
