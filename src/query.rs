//! Query Join Engine — reassembles denormalized documents at read time.
//!
//! Documents in the index reference each other by id arrays instead of
//! embedding. Each query here fetches its seed document(s) and then
//! resolves every level of referenced ids with a single batched lookup per
//! level, so the number of index round trips is bounded by the nesting
//! depth, not the result cardinality.
//!
//! Ids that do not resolve are skipped, never an error: a dangling id is a
//! normal transient state while the projector catches up with out-of-order
//! delivery.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::documents::{fields, Collection};
use crate::index::{DocumentIndex, IndexError};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("no hashtag matches '{0}'")]
    HashtagNotFound(String),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Read-side engine over the shared document index.
#[derive(Clone)]
pub struct QueryEngine {
    index: Arc<dyn DocumentIndex>,
}

impl QueryEngine {
    pub fn new(index: Arc<dyn DocumentIndex>) -> Self {
        Self { index }
    }

    /// `{user, projects: [{..., hashtags: [{id, name}]}]}` for one user.
    pub async fn projects_by_user(&self, user_id: i64) -> Result<Value, QueryError> {
        let user = self
            .index
            .fetch(Collection::Users, user_id)
            .await?
            .ok_or(QueryError::UserNotFound(user_id))?;

        let project_ids = id_array(&user, fields::PROJECT_IDS);
        let projects = self
            .index
            .fetch_many(Collection::Projects, &project_ids)
            .await?;

        // One hashtag batch for every project on this level.
        let hashtag_ids = collect_ids(&projects, fields::HASHTAG_IDS);
        let hashtags = self
            .index
            .fetch_many(Collection::Hashtags, &hashtag_ids)
            .await?;
        let hashtags_by_id = by_id(&hashtags);

        let projects: Vec<Value> = projects
            .iter()
            .map(|project| {
                let attached: Vec<Value> = id_array(project, fields::HASHTAG_IDS)
                    .iter()
                    .filter_map(|id| hashtags_by_id.get(id))
                    .map(|hashtag| {
                        json!({
                            "id": hashtag["id"],
                            "name": hashtag["name"],
                        })
                    })
                    .collect();

                let mut out = strip_ref_arrays(project, Collection::Projects);
                out.insert("hashtags".to_string(), Value::Array(attached));
                Value::Object(out)
            })
            .collect();

        Ok(json!({
            "user": {
                "id": user["id"],
                "name": user["name"],
                "created_at": user["created_at"],
            },
            "projects": projects,
        }))
    }

    /// `{hashtags: [{..., projects: [{..., users: [{id, name}]}]}]}` for a
    /// hashtag name.
    pub async fn projects_by_hashtag(&self, tag: &str) -> Result<Value, QueryError> {
        let matched = self.index.find_by_name(Collection::Hashtags, tag).await?;
        if matched.is_empty() {
            return Err(QueryError::HashtagNotFound(tag.to_string()));
        }

        let project_ids = collect_ids(&matched, fields::PROJECT_IDS);
        let projects = self
            .index
            .fetch_many(Collection::Projects, &project_ids)
            .await?;
        let projects_by_id = by_id(&projects);

        let user_ids = collect_ids(&projects, fields::USER_IDS);
        let users = self.index.fetch_many(Collection::Users, &user_ids).await?;
        let users_by_id = by_id(&users);

        let hashtags: Vec<Value> = matched
            .iter()
            .map(|hashtag| {
                let attached: Vec<Value> = id_array(hashtag, fields::PROJECT_IDS)
                    .iter()
                    .filter_map(|id| projects_by_id.get(id))
                    .map(|project| {
                        let project_users: Vec<Value> = id_array(project, fields::USER_IDS)
                            .iter()
                            .filter_map(|id| users_by_id.get(id))
                            .map(|user| {
                                json!({
                                    "id": user["id"],
                                    "name": user["name"],
                                })
                            })
                            .collect();

                        json!({
                            "id": project["id"],
                            "name": project["name"],
                            "slug": project["slug"],
                            "description": project["description"],
                            "users": project_users,
                        })
                    })
                    .collect();

                let mut out = strip_ref_arrays(hashtag, Collection::Hashtags);
                out.insert("projects".to_string(), Value::Array(attached));
                Value::Object(out)
            })
            .collect();

        Ok(json!({ "hashtags": hashtags }))
    }

    /// Fuzzy project search on slug/description, summaries only.
    pub async fn search_projects(
        &self,
        slug: Option<&str>,
        description: Option<&str>,
    ) -> Result<Value, QueryError> {
        let matched = self.index.search_projects(slug, description).await?;
        let projects: Vec<Value> = matched
            .iter()
            .map(|project| Value::Object(strip_ref_arrays(project, Collection::Projects)))
            .collect();

        Ok(json!({ "projects": projects }))
    }
}

/// The ids in a document's back-reference array, empty when absent.
fn id_array(doc: &Value, field: &str) -> Vec<i64> {
    doc.get(field)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

/// Union of a back-reference array across documents, first occurrence wins.
fn collect_ids(docs: &[Value], field: &str) -> Vec<i64> {
    let mut seen = Vec::new();
    for doc in docs {
        for id in id_array(doc, field) {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
    }
    seen
}

/// Lookup map from document id to document.
fn by_id(docs: &[Value]) -> HashMap<i64, &Value> {
    docs.iter()
        .filter_map(|doc| doc.get("id").and_then(Value::as_i64).map(|id| (id, doc)))
        .collect()
}

/// Clone a document's fields minus its raw back-reference arrays; the
/// caller replaces them with resolved detail objects.
fn strip_ref_arrays(doc: &Value, collection: Collection) -> Map<String, Value> {
    let mut out = doc.as_object().cloned().unwrap_or_default();
    for field in collection.ref_fields() {
        out.remove(*field);
    }
    out
}
