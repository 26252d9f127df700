//! Entity lifecycle and the referential asserts built on it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::op::{Assert, Op};
use crate::store::Store;
use crate::TxnError;

/// Collection holding one document per model.
pub const MODELS: &str = "models";
/// Collection holding machine (and container) documents.
pub const MACHINES: &str = "machines";
/// Collection holding unit documents.
pub const UNITS: &str = "units";
/// Collection holding subnet documents.
pub const SUBNETS: &str = "subnets";

/// Lifecycle of an entity referenced by other documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

impl Life {
    /// Read the `life` field of a document body. Documents without one are alive.
    pub fn of(body: &Value) -> Life {
        body.get("life")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn is_alive(self) -> bool {
        self == Life::Alive
    }

    pub fn is_dead(self) -> bool {
        self == Life::Dead
    }
}

impl std::fmt::Display for Life {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        })
    }
}

/// Body of a bare entity document with the given life.
pub fn entity_doc(life: Life) -> Value {
    serde_json::json!({ "life": life })
}

/// Op asserting the referenced entity is not dead.
pub fn assert_not_dead_op(collection: &str, id: impl Into<String>) -> Op {
    Op::assert(collection, id, Assert::NotDead)
}

/// Op asserting the referenced entity is alive.
pub fn assert_alive_op(collection: &str, id: impl Into<String>) -> Op {
    Op::assert(collection, id, Assert::Alive)
}

/// Read an entity's life, or `None` if the document does not exist.
pub async fn read_life(
    store: &dyn Store,
    collection: &str,
    id: &str,
) -> Result<Option<Life>, TxnError> {
    Ok(store
        .find(collection, id)
        .await?
        .map(|doc| Life::of(&doc.body)))
}

/// Fail unless the entity exists and is alive.
pub async fn check_alive(
    store: &dyn Store,
    collection: &str,
    id: &str,
    what: &str,
) -> Result<(), TxnError> {
    match read_life(store, collection, id).await? {
        None => Err(TxnError::NotFound(what.to_string())),
        Some(life) if life.is_alive() => Ok(()),
        Some(_) => Err(TxnError::NotAlive {
            entity: what.to_string(),
        }),
    }
}
