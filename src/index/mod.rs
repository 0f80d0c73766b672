//! The document index seam.
//!
//! [`DocumentIndex`] is the narrow interface the projector writes through
//! and the query engine reads through. It is injected as an `Arc` at
//! construction time — there is no hidden global client.
//!
//! Two implementations:
//!
//! - [`RedisIndex`]: the production backend. Scalar documents live as JSON
//!   values, back-reference arrays as per-document sets (so a scalar upsert
//!   structurally cannot clobber an array, and association mutations are
//!   idempotent at the store level).
//! - [`MemoryIndex`]: same contract in process memory, used by the test
//!   suite and useful for local runs without infrastructure.
//!
//! Documents surface as `serde_json::Value` objects with the back-reference
//! arrays already recombined, mirroring what a search hit's source would
//! look like.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::documents::Collection;

pub use memory::MemoryIndex;
pub use redis::RedisIndex;

/// Errors surfaced by an index backend.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index connection error: {0}")]
    Connection(String),

    #[error("index command error: {0}")]
    Command(String),

    #[error("index operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("stored document is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// The operations the pipeline needs from a document store.
///
/// Mutations are idempotent where the projector relies on it: `add_ref`
/// appends only if absent, `remove_ref` removes at most one matching entry.
/// Both return whether they changed anything. Reads that reference a
/// missing document report absence (`None` / skipped id) rather than an
/// error — a dangling back-reference is an expected transient state.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Create or replace the scalar fields of a document. Back-reference
    /// arrays are untouched, whether or not the document existed.
    async fn put_scalars(&self, collection: Collection, id: i64, scalars: Value)
        -> Result<(), IndexError>;

    /// Remove a document and its own back-reference arrays. Returns whether
    /// the document existed. References to this id held by other documents
    /// are left in place; the read path skips them.
    async fn remove(&self, collection: Collection, id: i64) -> Result<bool, IndexError>;

    /// Append `target` to a back-reference array unless already present.
    /// The array may belong to a document that does not exist yet.
    async fn add_ref(
        &self,
        collection: Collection,
        id: i64,
        field: &str,
        target: i64,
    ) -> Result<bool, IndexError>;

    /// Remove one occurrence of `target` from a back-reference array.
    async fn remove_ref(
        &self,
        collection: Collection,
        id: i64,
        field: &str,
        target: i64,
    ) -> Result<bool, IndexError>;

    /// Fetch a single document with its back-reference arrays recombined.
    async fn fetch(&self, collection: Collection, id: i64) -> Result<Option<Value>, IndexError>;

    /// Batched multi-id fetch. Missing ids are skipped, not errors, and the
    /// whole batch costs a bounded number of round trips regardless of
    /// cardinality.
    async fn fetch_many(
        &self,
        collection: Collection,
        ids: &[i64],
    ) -> Result<Vec<Value>, IndexError>;

    /// All documents whose `name` field matches, case-insensitively.
    async fn find_by_name(
        &self,
        collection: Collection,
        name: &str,
    ) -> Result<Vec<Value>, IndexError>;

    /// Project documents approximately matching `slug` OR `description`.
    async fn search_projects(
        &self,
        slug: Option<&str>,
        description: Option<&str>,
    ) -> Result<Vec<Value>, IndexError>;
}

/// Approximate match used by the project search: substring containment or a
/// close edit distance on the whole field.
pub(crate) fn fuzzy_matches(field_value: &str, query: &str) -> bool {
    if query.is_empty() {
        return false;
    }
    let field = field_value.to_lowercase();
    let query = query.to_lowercase();
    if field.contains(&query) {
        return true;
    }
    strsim::normalized_levenshtein(&field, &query) >= 0.7
}

/// Shared fuzzy predicate over a project document.
pub(crate) fn project_matches(doc: &Value, slug: Option<&str>, description: Option<&str>) -> bool {
    let field_matches = |field: &str, query: Option<&str>| {
        query
            .filter(|q| !q.is_empty())
            .map(|q| {
                doc.get(field)
                    .and_then(Value::as_str)
                    .is_some_and(|v| fuzzy_matches(v, q))
            })
            .unwrap_or(false)
    };

    field_matches("slug", slug) || field_matches("description", description)
}
