//! First-start seeding of the store.

use fleet_id::ModelUuid;
use fleet_txn::{entity_doc, Life, Op, Store, TxnError, MODELS};
use tracing::{debug, info};

/// Insert the model document unless it already exists.
///
/// Returns true if the document was created.
pub async fn ensure_model(store: &dyn Store, model: ModelUuid) -> Result<bool, TxnError> {
    let id = model.to_string();
    if store.find(MODELS, &id).await?.is_some() {
        debug!(model = %model, "Model document present");
        return Ok(false);
    }
    match store
        .apply(&[Op::insert(MODELS, id, entity_doc(Life::Alive))])
        .await
    {
        Ok(()) => {
            info!(model = %model, "Seeded model document");
            Ok(true)
        }
        // Another agent seeded it first.
        Err(e) if e.is_aborted() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_txn::MemoryStore;

    #[tokio::test]
    async fn test_ensure_model_is_idempotent() {
        let store = MemoryStore::new();
        let model = ModelUuid::new();

        assert!(ensure_model(&store, model).await.unwrap());
        assert!(!ensure_model(&store, model).await.unwrap());

        let doc = store.find(MODELS, &model.to_string()).await.unwrap().unwrap();
        assert_eq!(Life::of(&doc.body), Life::Alive);
    }
}
