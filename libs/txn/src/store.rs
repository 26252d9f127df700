//! Store interface and the op-application routine shared by implementations.
//!
//! A store holds JSON documents keyed by `(collection, id)`, each with a
//! revision number. The only write path is [`Store::apply`]: every assert in
//! the list is checked against the current state first, and only if all of
//! them hold are the mutations applied. A failed assert surfaces as
//! [`StoreError::Aborted`] and leaves the store untouched.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::life::Life;
use crate::op::{Assert, DocChange, Mutation, Op, StoredDoc};
use crate::StoreError;

/// Shared multi-writer document store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch one document.
    async fn find(&self, collection: &str, id: &str) -> Result<Option<StoredDoc>, StoreError>;

    /// Fetch every document in a collection, ordered by id.
    async fn find_all(&self, collection: &str) -> Result<Vec<(String, StoredDoc)>, StoreError>;

    /// Apply a list of conditional ops atomically.
    async fn apply(&self, ops: &[Op]) -> Result<(), StoreError>;

    /// Subscribe to committed changes.
    fn subscribe(&self) -> broadcast::Receiver<DocChange>;
}

/// Capacity of the change broadcast channel.
pub const CHANGE_BUFFER: usize = 1024;

/// Row-level access used by [`apply_ops`].
pub(crate) trait DocTable {
    fn get(&mut self, collection: &str, id: &str) -> Result<Option<StoredDoc>, StoreError>;
    fn put(&mut self, collection: &str, id: &str, doc: &StoredDoc) -> Result<(), StoreError>;
    fn delete(&mut self, collection: &str, id: &str) -> Result<(), StoreError>;
}

fn aborted(op: &Op, reason: impl Into<String>) -> StoreError {
    StoreError::Aborted {
        collection: op.collection.clone(),
        id: op.id.clone(),
        reason: reason.into(),
    }
}

fn check(op: &Op, current: Option<&StoredDoc>) -> Result<(), StoreError> {
    match (&op.assert, current) {
        (Assert::None, _) => {}
        (Assert::DocMissing, Some(_)) => return Err(aborted(op, "document exists")),
        (Assert::DocMissing, None) => {}
        (Assert::DocExists | Assert::Revno(_) | Assert::NotDead | Assert::Alive, None) => {
            return Err(aborted(op, "document missing"))
        }
        (Assert::DocExists, Some(_)) => {}
        (Assert::Revno(expected), Some(doc)) => {
            if doc.revno != *expected {
                return Err(aborted(
                    op,
                    format!("revno {} != expected {}", doc.revno, expected),
                ));
            }
        }
        (Assert::NotDead, Some(doc)) => {
            if Life::of(&doc.body).is_dead() {
                return Err(aborted(op, "entity is dead"));
            }
        }
        (Assert::Alive, Some(doc)) => {
            let life = Life::of(&doc.body);
            if !life.is_alive() {
                return Err(aborted(op, format!("entity is {life}")));
            }
        }
    }

    match (&op.mutation, current) {
        (Mutation::Insert(_), Some(_)) => Err(aborted(op, "document exists")),
        (Mutation::Set(_) | Mutation::AddToSet { .. } | Mutation::Remove, None) => {
            Err(aborted(op, "document missing"))
        }
        _ => Ok(()),
    }
}

fn merge_fields(body: &mut Value, fields: &Value) {
    match (body.as_object_mut(), fields.as_object()) {
        (Some(target), Some(source)) => {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *body = fields.clone(),
    }
}

/// Returns true if the body changed.
fn add_to_set(body: &mut Value, field: &str, value: &Value) -> bool {
    let Some(object) = body.as_object_mut() else {
        return false;
    };
    let entry = object
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    match entry {
        Value::Array(items) if items.contains(value) => false,
        Value::Array(items) => {
            items.push(value.clone());
            true
        }
        other => {
            *other = Value::Array(vec![value.clone()]);
            true
        }
    }
}

/// Check every assert, then apply every mutation.
///
/// Returns the changes to broadcast once the caller commits.
pub(crate) fn apply_ops(
    table: &mut impl DocTable,
    ops: &[Op],
) -> Result<Vec<DocChange>, StoreError> {
    for op in ops {
        let current = table.get(&op.collection, &op.id)?;
        check(op, current.as_ref())?;
    }

    let mut changes = Vec::new();
    for op in ops {
        let revno = match &op.mutation {
            Mutation::None => continue,
            Mutation::Insert(body) => {
                let doc = StoredDoc {
                    revno: 1,
                    body: body.clone(),
                };
                table.put(&op.collection, &op.id, &doc)?;
                Some(doc.revno)
            }
            Mutation::Set(fields) => {
                let Some(mut doc) = table.get(&op.collection, &op.id)? else {
                    return Err(aborted(op, "document missing"));
                };
                merge_fields(&mut doc.body, fields);
                doc.revno += 1;
                table.put(&op.collection, &op.id, &doc)?;
                Some(doc.revno)
            }
            Mutation::AddToSet { field, value } => {
                let Some(mut doc) = table.get(&op.collection, &op.id)? else {
                    return Err(aborted(op, "document missing"));
                };
                if !add_to_set(&mut doc.body, field, value) {
                    continue;
                }
                doc.revno += 1;
                table.put(&op.collection, &op.id, &doc)?;
                Some(doc.revno)
            }
            Mutation::Remove => {
                table.delete(&op.collection, &op.id)?;
                None
            }
        };
        changes.push(DocChange {
            collection: op.collection.clone(),
            id: op.id.clone(),
            revno,
        });
    }

    Ok(changes)
}

/// Load and decode one document, returning its revision alongside.
pub async fn load<T: serde::de::DeserializeOwned>(
    store: &dyn Store,
    collection: &str,
    id: &str,
) -> Result<Option<(i64, T)>, crate::TxnError> {
    match store.find(collection, id).await? {
        Some(doc) => Ok(Some((doc.revno, doc.decode()?))),
        None => Ok(None),
    }
}
