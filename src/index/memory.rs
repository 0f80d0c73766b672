//! In-process index backend.
//!
//! Implements the same contract as the Redis backend over a `RwLock`ed map,
//! including the pending-reference behavior: back-reference arrays can
//! exist before their document does, and reattach the moment the entity
//! event lands.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

use super::{project_matches, DocumentIndex, IndexError};
use crate::documents::Collection;

#[derive(Default)]
struct Shard {
    scalars: HashMap<i64, Value>,
    refs: HashMap<i64, BTreeMap<String, BTreeSet<i64>>>,
}

impl Shard {
    fn recombine(&self, collection: Collection, id: i64) -> Option<Value> {
        let mut doc = self.scalars.get(&id)?.clone();
        let obj = doc.as_object_mut()?;
        for field in collection.ref_fields() {
            let ids: Vec<i64> = self
                .refs
                .get(&id)
                .and_then(|fields| fields.get(*field))
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            obj.insert((*field).to_string(), ids.into());
        }
        Some(doc)
    }
}

/// Index backend holding everything in process memory.
#[derive(Default)]
pub struct MemoryIndex {
    shards: RwLock<HashMap<Collection, Shard>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentIndex for MemoryIndex {
    async fn put_scalars(
        &self,
        collection: Collection,
        id: i64,
        scalars: Value,
    ) -> Result<(), IndexError> {
        let mut shards = self.shards.write().await;
        shards.entry(collection).or_default().scalars.insert(id, scalars);
        Ok(())
    }

    async fn remove(&self, collection: Collection, id: i64) -> Result<bool, IndexError> {
        let mut shards = self.shards.write().await;
        let shard = shards.entry(collection).or_default();
        shard.refs.remove(&id);
        Ok(shard.scalars.remove(&id).is_some())
    }

    async fn add_ref(
        &self,
        collection: Collection,
        id: i64,
        field: &str,
        target: i64,
    ) -> Result<bool, IndexError> {
        let mut shards = self.shards.write().await;
        let added = shards
            .entry(collection)
            .or_default()
            .refs
            .entry(id)
            .or_default()
            .entry(field.to_string())
            .or_default()
            .insert(target);
        Ok(added)
    }

    async fn remove_ref(
        &self,
        collection: Collection,
        id: i64,
        field: &str,
        target: i64,
    ) -> Result<bool, IndexError> {
        let mut shards = self.shards.write().await;
        let removed = shards
            .entry(collection)
            .or_default()
            .refs
            .get_mut(&id)
            .and_then(|fields| fields.get_mut(field))
            .map(|set| set.remove(&target))
            .unwrap_or(false);
        Ok(removed)
    }

    async fn fetch(&self, collection: Collection, id: i64) -> Result<Option<Value>, IndexError> {
        let shards = self.shards.read().await;
        Ok(shards
            .get(&collection)
            .and_then(|shard| shard.recombine(collection, id)))
    }

    async fn fetch_many(
        &self,
        collection: Collection,
        ids: &[i64],
    ) -> Result<Vec<Value>, IndexError> {
        let shards = self.shards.read().await;
        let Some(shard) = shards.get(&collection) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| shard.recombine(collection, *id))
            .collect())
    }

    async fn find_by_name(
        &self,
        collection: Collection,
        name: &str,
    ) -> Result<Vec<Value>, IndexError> {
        let shards = self.shards.read().await;
        let Some(shard) = shards.get(&collection) else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<i64> = shard
            .scalars
            .iter()
            .filter(|(_, scalars)| {
                scalars
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|v| v.eq_ignore_ascii_case(name))
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .filter_map(|id| shard.recombine(collection, id))
            .collect())
    }

    async fn search_projects(
        &self,
        slug: Option<&str>,
        description: Option<&str>,
    ) -> Result<Vec<Value>, IndexError> {
        let shards = self.shards.read().await;
        let Some(shard) = shards.get(&Collection::Projects) else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<i64> = shard
            .scalars
            .iter()
            .filter(|(_, scalars)| project_matches(scalars, slug, description))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .filter_map(|id| shard.recombine(Collection::Projects, id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::fields;
    use serde_json::json;

    fn index() -> MemoryIndex {
        MemoryIndex::new()
    }

    #[tokio::test]
    async fn add_ref_is_idempotent() {
        let idx = index();
        idx.put_scalars(Collection::Users, 1, json!({"id": 1, "name": "Jane"}))
            .await
            .unwrap();

        assert!(idx
            .add_ref(Collection::Users, 1, fields::PROJECT_IDS, 10)
            .await
            .unwrap());
        assert!(!idx
            .add_ref(Collection::Users, 1, fields::PROJECT_IDS, 10)
            .await
            .unwrap());

        let doc = idx.fetch(Collection::Users, 1).await.unwrap().unwrap();
        assert_eq!(doc[fields::PROJECT_IDS], json!([10]));
    }

    #[tokio::test]
    async fn remove_ref_takes_out_one_entry() {
        let idx = index();
        idx.put_scalars(Collection::Users, 1, json!({"id": 1}))
            .await
            .unwrap();
        idx.add_ref(Collection::Users, 1, fields::PROJECT_IDS, 10)
            .await
            .unwrap();

        assert!(idx
            .remove_ref(Collection::Users, 1, fields::PROJECT_IDS, 10)
            .await
            .unwrap());
        // Gone already; removing again is a no-op, not an error.
        assert!(!idx
            .remove_ref(Collection::Users, 1, fields::PROJECT_IDS, 10)
            .await
            .unwrap());

        let doc = idx.fetch(Collection::Users, 1).await.unwrap().unwrap();
        assert_eq!(doc[fields::PROJECT_IDS], json!([]));
    }

    #[tokio::test]
    async fn scalar_upsert_preserves_refs() {
        let idx = index();
        idx.put_scalars(Collection::Projects, 10, json!({"id": 10, "description": "old"}))
            .await
            .unwrap();
        idx.add_ref(Collection::Projects, 10, fields::HASHTAG_IDS, 5)
            .await
            .unwrap();

        idx.put_scalars(Collection::Projects, 10, json!({"id": 10, "description": "new"}))
            .await
            .unwrap();

        let doc = idx.fetch(Collection::Projects, 10).await.unwrap().unwrap();
        assert_eq!(doc["description"], "new");
        assert_eq!(doc[fields::HASHTAG_IDS], json!([5]));
    }

    #[tokio::test]
    async fn refs_survive_until_the_document_arrives() {
        let idx = index();
        idx.add_ref(Collection::Projects, 99, fields::USER_IDS, 1)
            .await
            .unwrap();

        // No scalars yet: the document does not exist.
        assert!(idx.fetch(Collection::Projects, 99).await.unwrap().is_none());

        idx.put_scalars(Collection::Projects, 99, json!({"id": 99, "name": "late"}))
            .await
            .unwrap();
        let doc = idx.fetch(Collection::Projects, 99).await.unwrap().unwrap();
        assert_eq!(doc[fields::USER_IDS], json!([1]));
    }

    #[tokio::test]
    async fn fetch_many_skips_missing_ids() {
        let idx = index();
        idx.put_scalars(Collection::Projects, 10, json!({"id": 10}))
            .await
            .unwrap();
        idx.put_scalars(Collection::Projects, 12, json!({"id": 12}))
            .await
            .unwrap();

        let docs = idx
            .fetch_many(Collection::Projects, &[10, 11, 12])
            .await
            .unwrap();
        let ids: Vec<i64> = docs.iter().map(|d| d["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![10, 12]);
    }

    #[tokio::test]
    async fn remove_drops_document_and_its_refs() {
        let idx = index();
        idx.put_scalars(Collection::Users, 1, json!({"id": 1}))
            .await
            .unwrap();
        idx.add_ref(Collection::Users, 1, fields::PROJECT_IDS, 10)
            .await
            .unwrap();

        assert!(idx.remove(Collection::Users, 1).await.unwrap());
        assert!(!idx.remove(Collection::Users, 1).await.unwrap());
        assert!(idx.fetch(Collection::Users, 1).await.unwrap().is_none());

        // A re-created document starts with empty arrays.
        idx.put_scalars(Collection::Users, 1, json!({"id": 1}))
            .await
            .unwrap();
        let doc = idx.fetch(Collection::Users, 1).await.unwrap().unwrap();
        assert_eq!(doc[fields::PROJECT_IDS], json!([]));
    }

    #[tokio::test]
    async fn find_by_name_ignores_case() {
        let idx = index();
        idx.put_scalars(Collection::Hashtags, 5, json!({"id": 5, "name": "Tech"}))
            .await
            .unwrap();

        let found = idx.find_by_name(Collection::Hashtags, "tech").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], 5);

        assert!(idx
            .find_by_name(Collection::Hashtags, "art")
            .await
            .unwrap()
            .is_empty());
    }
}
