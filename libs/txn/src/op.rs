//! Conditional operations submitted to a store as one all-or-nothing unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDoc {
    /// Revision token; 1 after insert, bumped by every committed change.
    pub revno: i64,

    /// Document body.
    pub body: Value,
}

impl StoredDoc {
    /// Decode the body into a typed document.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

/// Precondition checked against the current document before any op in the
/// list is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Assert {
    /// No precondition.
    None,
    /// The document must not exist.
    DocMissing,
    /// The document must exist.
    DocExists,
    /// The document must exist at exactly this revision.
    Revno(i64),
    /// The document must exist and its `life` must not be `dead`.
    NotDead,
    /// The document must exist and its `life` must be `alive`.
    Alive,
}

/// Change applied to a document once every assert in the list holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Assert only.
    None,
    /// Create the document. Implies the document is missing.
    Insert(Value),
    /// Merge these top-level fields into the document. Implies it exists.
    Set(Value),
    /// Append `value` to the array `field` unless an equal element is present.
    /// Implies the document exists.
    AddToSet { field: String, value: Value },
    /// Delete the document. Implies it exists.
    Remove,
}

/// One conditional operation on one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub collection: String,
    pub id: String,
    pub assert: Assert,
    pub mutation: Mutation,
}

impl Op {
    /// An op that only checks a precondition.
    pub fn assert(collection: &str, id: impl Into<String>, assert: Assert) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.into(),
            assert,
            mutation: Mutation::None,
        }
    }

    /// Insert a new document; asserts it is missing.
    pub fn insert(collection: &str, id: impl Into<String>, body: Value) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.into(),
            assert: Assert::DocMissing,
            mutation: Mutation::Insert(body),
        }
    }

    /// Merge fields into an existing document.
    pub fn set(collection: &str, id: impl Into<String>, assert: Assert, fields: Value) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.into(),
            assert,
            mutation: Mutation::Set(fields),
        }
    }

    /// Append to an array field of an existing document.
    pub fn add_to_set(
        collection: &str,
        id: impl Into<String>,
        assert: Assert,
        field: &str,
        value: Value,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.into(),
            assert,
            mutation: Mutation::AddToSet {
                field: field.to_string(),
                value,
            },
        }
    }

    /// Remove an existing document.
    pub fn remove(collection: &str, id: impl Into<String>, assert: Assert) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.into(),
            assert,
            mutation: Mutation::Remove,
        }
    }
}

/// A committed change to one document, broadcast to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChange {
    pub collection: String,
    pub id: String,
    /// Revision after the change; `None` when the document was removed.
    pub revno: Option<i64>,
}
