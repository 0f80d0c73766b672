//! Redis-backed index backend.
//!
//! Layout, per entity:
//!
//! ```text
//! docsync:projects:10              -> JSON scalar document
//! docsync:projects:10:hashtag_ids  -> SET of hashtag ids
//! docsync:projects:10:user_ids     -> SET of user ids
//! docsync:projects:ids             -> SET of all project ids (scan support)
//! ```
//!
//! Back-reference arrays are sets, which carries the association semantics
//! the projector needs directly in the store: `SADD` is append-if-absent,
//! `SREM` removes at most one entry, and both are safe to replay. Scalars
//! and arrays live under different keys, so an entity upsert cannot touch
//! an array, and an array can accumulate edges before its document exists.

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, pipe};
use deadpool_redis::Pool;
use serde_json::Value;

use super::{project_matches, DocumentIndex, IndexError};
use crate::documents::Collection;

const KEY_PREFIX: &str = "docsync";

/// Index backend over a shared Redis pool.
///
/// The pool is process-wide and safe for concurrent use; the projector and
/// the query engine hold clones of the same `RedisIndex`.
#[derive(Clone)]
pub struct RedisIndex {
    pool: Pool,
}

impl RedisIndex {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, IndexError> {
        self.pool
            .get()
            .await
            .map_err(|e| IndexError::Connection(e.to_string()))
    }

    fn doc_key(collection: Collection, id: i64) -> String {
        format!("{KEY_PREFIX}:{collection}:{id}")
    }

    fn ref_key(collection: Collection, id: i64, field: &str) -> String {
        format!("{KEY_PREFIX}:{collection}:{id}:{field}")
    }

    fn registry_key(collection: Collection) -> String {
        format!("{KEY_PREFIX}:{collection}:ids")
    }

    /// Attach the (sorted) back-reference arrays to a batch of raw scalar
    /// documents. One pipeline round trip for the whole batch.
    async fn recombine_batch(
        &self,
        collection: Collection,
        ids: &[i64],
        raws: Vec<Option<String>>,
    ) -> Result<Vec<Value>, IndexError> {
        let ref_fields = collection.ref_fields();

        let mut conn = self.conn().await?;
        let mut pipeline = pipe();
        for id in ids {
            for field in ref_fields {
                pipeline.cmd("SMEMBERS").arg(Self::ref_key(collection, *id, field));
            }
        }
        let mut refs: Vec<Vec<i64>> = pipeline
            .query_async(&mut conn)
            .await
            .map_err(|e| IndexError::Command(e.to_string()))?;
        for set in &mut refs {
            set.sort_unstable();
        }

        let mut docs = Vec::new();
        for (pos, raw) in raws.into_iter().enumerate() {
            let Some(raw) = raw else { continue };
            let mut doc: Value = serde_json::from_str(&raw)?;
            if let Some(obj) = doc.as_object_mut() {
                for (offset, field) in ref_fields.iter().enumerate() {
                    let members = refs
                        .get(pos * ref_fields.len() + offset)
                        .cloned()
                        .unwrap_or_default();
                    obj.insert((*field).to_string(), members.into());
                }
            }
            docs.push(doc);
        }
        Ok(docs)
    }

    /// Fetch every document in the collection, refs attached. Used by the
    /// scan-style queries (name match, fuzzy search).
    async fn scan_all(&self, collection: Collection) -> Result<Vec<Value>, IndexError> {
        let mut conn = self.conn().await?;
        let mut ids: Vec<i64> = cmd("SMEMBERS")
            .arg(Self::registry_key(collection))
            .query_async(&mut conn)
            .await
            .map_err(|e| IndexError::Command(e.to_string()))?;
        ids.sort_unstable();
        drop(conn);
        self.fetch_many(collection, &ids).await
    }
}

#[async_trait]
impl DocumentIndex for RedisIndex {
    async fn put_scalars(
        &self,
        collection: Collection,
        id: i64,
        scalars: Value,
    ) -> Result<(), IndexError> {
        let raw = serde_json::to_string(&scalars)?;
        let mut conn = self.conn().await?;
        let _: () = pipe()
            .atomic()
            .cmd("SET")
            .arg(Self::doc_key(collection, id))
            .arg(raw)
            .ignore()
            .cmd("SADD")
            .arg(Self::registry_key(collection))
            .arg(id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| IndexError::Command(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, collection: Collection, id: i64) -> Result<bool, IndexError> {
        let mut conn = self.conn().await?;
        let mut pipeline = pipe();
        pipeline
            .atomic()
            .cmd("DEL")
            .arg(Self::doc_key(collection, id));
        for field in collection.ref_fields() {
            pipeline
                .cmd("DEL")
                .arg(Self::ref_key(collection, id, field))
                .ignore();
        }
        pipeline
            .cmd("SREM")
            .arg(Self::registry_key(collection))
            .arg(id)
            .ignore();

        let (deleted,): (i64,) = pipeline
            .query_async(&mut conn)
            .await
            .map_err(|e| IndexError::Command(e.to_string()))?;
        Ok(deleted > 0)
    }

    async fn add_ref(
        &self,
        collection: Collection,
        id: i64,
        field: &str,
        target: i64,
    ) -> Result<bool, IndexError> {
        let mut conn = self.conn().await?;
        let added: i64 = cmd("SADD")
            .arg(Self::ref_key(collection, id, field))
            .arg(target)
            .query_async(&mut conn)
            .await
            .map_err(|e| IndexError::Command(e.to_string()))?;
        Ok(added > 0)
    }

    async fn remove_ref(
        &self,
        collection: Collection,
        id: i64,
        field: &str,
        target: i64,
    ) -> Result<bool, IndexError> {
        let mut conn = self.conn().await?;
        let removed: i64 = cmd("SREM")
            .arg(Self::ref_key(collection, id, field))
            .arg(target)
            .query_async(&mut conn)
            .await
            .map_err(|e| IndexError::Command(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn fetch(&self, collection: Collection, id: i64) -> Result<Option<Value>, IndexError> {
        Ok(self.fetch_many(collection, &[id]).await?.into_iter().next())
    }

    async fn fetch_many(
        &self,
        collection: Collection,
        ids: &[i64],
    ) -> Result<Vec<Value>, IndexError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| Self::doc_key(collection, *id)).collect();
        let mut conn = self.conn().await?;
        let raws: Vec<Option<String>> = cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| IndexError::Command(e.to_string()))?;
        drop(conn);

        self.recombine_batch(collection, ids, raws).await
    }

    async fn find_by_name(
        &self,
        collection: Collection,
        name: &str,
    ) -> Result<Vec<Value>, IndexError> {
        let docs = self.scan_all(collection).await?;
        Ok(docs
            .into_iter()
            .filter(|doc| {
                doc.get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|v| v.eq_ignore_ascii_case(name))
            })
            .collect())
    }

    async fn search_projects(
        &self,
        slug: Option<&str>,
        description: Option<&str>,
    ) -> Result<Vec<Value>, IndexError> {
        let docs = self.scan_all(Collection::Projects).await?;
        Ok(docs
            .into_iter()
            .filter(|doc| project_matches(doc, slug, description))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(RedisIndex::doc_key(Collection::Projects, 10), "docsync:projects:10");
        assert_eq!(
            RedisIndex::ref_key(Collection::Projects, 10, "hashtag_ids"),
            "docsync:projects:10:hashtag_ids"
        );
        assert_eq!(RedisIndex::registry_key(Collection::Users), "docsync:users:ids");
    }
}
