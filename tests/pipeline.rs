//! End-to-end projection + query scenarios over the in-memory index.
//!
//! These drive the same Projector and QueryEngine the binaries wire up,
//! feeding decoded change events straight into the projector the way the
//! consumer loop does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use docsync::change::{ChangeEnvelope, Operation, TableChange};
use docsync::documents::{fields, Collection};
use docsync::index::{DocumentIndex, IndexError, MemoryIndex};
use docsync::projector::{Projector, ProjectorError};
use docsync::query::{QueryEngine, QueryError};

struct Pipeline {
    index: Arc<MemoryIndex>,
    projector: Projector,
    query: QueryEngine,
}

fn pipeline() -> Pipeline {
    let index = Arc::new(MemoryIndex::new());
    Pipeline {
        projector: Projector::new(index.clone()),
        query: QueryEngine::new(index.clone()),
        index,
    }
}

async fn apply(projector: &Projector, table: &str, op: Operation, data: Value) {
    let envelope = ChangeEnvelope::new(table, op, data);
    let change = TableChange::decode(&envelope).unwrap();
    projector.apply(&change).await.unwrap();
}

async fn seed_user_project(p: &Pipeline) {
    apply(
        &p.projector,
        "users",
        Operation::Insert,
        json!({"id": 1, "name": "Jane", "created_at": "2024-01-01T00:00:00Z"}),
    )
    .await;
    apply(
        &p.projector,
        "projects",
        Operation::Insert,
        json!({"id": 10, "name": "Pipeline", "slug": "pipeline", "description": "cdc", "created_at": "2024-01-02T00:00:00Z"}),
    )
    .await;
    apply(
        &p.projector,
        "user_projects",
        Operation::Insert,
        json!({"user_id": 1, "project_id": 10}),
    )
    .await;
}

#[tokio::test]
async fn user_query_returns_joined_projects() {
    let p = pipeline();
    seed_user_project(&p).await;

    let view = p.query.projects_by_user(1).await.unwrap();
    assert_eq!(view["user"]["name"], "Jane");

    let projects = view["projects"].as_array().unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0]["id"], 10);
    assert_eq!(projects[0]["name"], "Pipeline");
}

#[tokio::test]
async fn hashtag_query_returns_joined_projects_and_users() {
    let p = pipeline();
    seed_user_project(&p).await;
    apply(
        &p.projector,
        "hashtags",
        Operation::Insert,
        json!({"id": 5, "name": "Tech", "created_at": "2024-01-03T00:00:00Z"}),
    )
    .await;
    apply(
        &p.projector,
        "project_hashtags",
        Operation::Insert,
        json!({"project_id": 10, "hashtag_id": 5}),
    )
    .await;

    let view = p.query.projects_by_hashtag("Tech").await.unwrap();
    let hashtags = view["hashtags"].as_array().unwrap();
    assert_eq!(hashtags.len(), 1);

    let projects = hashtags[0]["projects"].as_array().unwrap();
    let ids: Vec<i64> = projects.iter().map(|pr| pr["id"].as_i64().unwrap()).collect();
    assert!(ids.contains(&10));
    assert_eq!(projects[0]["users"], json!([{"id": 1, "name": "Jane"}]));
}

#[tokio::test]
async fn association_delete_empties_the_join() {
    let p = pipeline();
    seed_user_project(&p).await;

    apply(
        &p.projector,
        "user_projects",
        Operation::Delete,
        json!({"user_id": 1, "project_id": 10}),
    )
    .await;

    let view = p.query.projects_by_user(1).await.unwrap();
    assert_eq!(view["projects"], json!([]));

    // The project side was retracted too.
    let project = p.index.fetch(Collection::Projects, 10).await.unwrap().unwrap();
    assert_eq!(project[fields::USER_IDS], json!([]));
}

#[tokio::test]
async fn duplicate_association_insert_is_idempotent() {
    let p = pipeline();
    seed_user_project(&p).await;
    apply(
        &p.projector,
        "user_projects",
        Operation::Insert,
        json!({"user_id": 1, "project_id": 10}),
    )
    .await;

    let user = p.index.fetch(Collection::Users, 1).await.unwrap().unwrap();
    assert_eq!(user[fields::PROJECT_IDS], json!([10]));

    let view = p.query.projects_by_user(1).await.unwrap();
    assert_eq!(view["projects"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn entity_update_does_not_touch_associations() {
    let p = pipeline();
    seed_user_project(&p).await;

    apply(
        &p.projector,
        "projects",
        Operation::Update,
        json!({"id": 10, "name": "Pipeline", "slug": "pipeline", "description": "rewritten", "created_at": "2024-01-02T00:00:00Z"}),
    )
    .await;

    let project = p.index.fetch(Collection::Projects, 10).await.unwrap().unwrap();
    assert_eq!(project["description"], "rewritten");
    assert_eq!(project[fields::USER_IDS], json!([1]));

    let view = p.query.projects_by_user(1).await.unwrap();
    assert_eq!(view["projects"][0]["description"], "rewritten");
}

#[tokio::test]
async fn unknown_table_mutates_nothing() {
    let p = pipeline();
    seed_user_project(&p).await;
    let before = p.query.projects_by_user(1).await.unwrap();

    apply(
        &p.projector,
        "audit_log",
        Operation::Insert,
        json!({"id": 1, "who": "nobody"}),
    )
    .await;

    let after = p.query.projects_by_user(1).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn out_of_order_association_is_tolerated_then_repaired() {
    let p = pipeline();
    apply(&p.projector, "users", Operation::Insert, json!({"id": 1, "name": "Jane"})).await;

    // Edge for a project whose INSERT has not arrived yet.
    apply(
        &p.projector,
        "user_projects",
        Operation::Insert,
        json!({"user_id": 1, "project_id": 99}),
    )
    .await;

    // The dangling id is held on the user document...
    let user = p.index.fetch(Collection::Users, 1).await.unwrap().unwrap();
    assert_eq!(user[fields::PROJECT_IDS], json!([99]));

    // ...and the join skips it without erroring while unresolved.
    let view = p.query.projects_by_user(1).await.unwrap();
    assert_eq!(view["projects"], json!([]));

    // The late entity event completes the picture on both sides.
    apply(
        &p.projector,
        "projects",
        Operation::Insert,
        json!({"id": 99, "name": "Late", "slug": "late", "description": "", "created_at": ""}),
    )
    .await;

    let view = p.query.projects_by_user(1).await.unwrap();
    assert_eq!(view["projects"][0]["id"], 99);

    let project = p.index.fetch(Collection::Projects, 99).await.unwrap().unwrap();
    assert_eq!(project[fields::USER_IDS], json!([1]));
}

#[tokio::test]
async fn entity_delete_leaves_tolerated_dangling_references() {
    let p = pipeline();
    seed_user_project(&p).await;

    apply(&p.projector, "projects", Operation::Delete, json!({"id": 10})).await;

    // The user still references the deleted project; the join skips it.
    let user = p.index.fetch(Collection::Users, 1).await.unwrap().unwrap();
    assert_eq!(user[fields::PROJECT_IDS], json!([10]));

    let view = p.query.projects_by_user(1).await.unwrap();
    assert_eq!(view["projects"], json!([]));
}

#[tokio::test]
async fn fuzzy_search_matches_slug_or_description() {
    let p = pipeline();
    seed_user_project(&p).await;
    apply(
        &p.projector,
        "projects",
        Operation::Insert,
        json!({"id": 11, "name": "Dash", "slug": "dashboard", "description": "metrics ui", "created_at": ""}),
    )
    .await;

    let by_slug = p.query.search_projects(Some("pipelin"), None).await.unwrap();
    let ids: Vec<i64> = by_slug["projects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|pr| pr["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![10]);

    let by_description = p
        .query
        .search_projects(Some("zzz"), Some("metrics"))
        .await
        .unwrap();
    let ids: Vec<i64> = by_description["projects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|pr| pr["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![11]);
}

#[tokio::test]
async fn missing_user_seed_is_reported_not_swallowed() {
    let p = pipeline();
    assert!(matches!(
        p.query.projects_by_user(404).await,
        Err(QueryError::UserNotFound(404))
    ));
}

/// Index wrapper that fails `add_ref` against one collection while armed,
/// for exercising the two-sided divergence path.
struct FlakyIndex {
    inner: MemoryIndex,
    fail_collection: Collection,
    armed: AtomicBool,
}

impl FlakyIndex {
    fn new(fail_collection: Collection) -> Self {
        Self {
            inner: MemoryIndex::new(),
            fail_collection,
            armed: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentIndex for FlakyIndex {
    async fn put_scalars(
        &self,
        collection: Collection,
        id: i64,
        scalars: Value,
    ) -> Result<(), IndexError> {
        self.inner.put_scalars(collection, id, scalars).await
    }

    async fn remove(&self, collection: Collection, id: i64) -> Result<bool, IndexError> {
        self.inner.remove(collection, id).await
    }

    async fn add_ref(
        &self,
        collection: Collection,
        id: i64,
        field: &str,
        target: i64,
    ) -> Result<bool, IndexError> {
        if collection == self.fail_collection && self.armed.load(Ordering::SeqCst) {
            return Err(IndexError::Command("injected failure".to_string()));
        }
        self.inner.add_ref(collection, id, field, target).await
    }

    async fn remove_ref(
        &self,
        collection: Collection,
        id: i64,
        field: &str,
        target: i64,
    ) -> Result<bool, IndexError> {
        self.inner.remove_ref(collection, id, field, target).await
    }

    async fn fetch(&self, collection: Collection, id: i64) -> Result<Option<Value>, IndexError> {
        self.inner.fetch(collection, id).await
    }

    async fn fetch_many(
        &self,
        collection: Collection,
        ids: &[i64],
    ) -> Result<Vec<Value>, IndexError> {
        self.inner.fetch_many(collection, ids).await
    }

    async fn find_by_name(
        &self,
        collection: Collection,
        name: &str,
    ) -> Result<Vec<Value>, IndexError> {
        self.inner.find_by_name(collection, name).await
    }

    async fn search_projects(
        &self,
        slug: Option<&str>,
        description: Option<&str>,
    ) -> Result<Vec<Value>, IndexError> {
        self.inner.search_projects(slug, description).await
    }
}

#[tokio::test]
async fn one_sided_failure_surfaces_divergence_and_stays_repairable() {
    let index = Arc::new(FlakyIndex::new(Collection::Projects));
    let projector = Projector::new(index.clone());

    apply(&projector, "users", Operation::Insert, json!({"id": 1, "name": "Jane"})).await;
    apply(&projector, "projects", Operation::Insert, json!({"id": 10})).await;

    index.arm();
    let envelope = ChangeEnvelope::new(
        "user_projects",
        Operation::Insert,
        json!({"user_id": 1, "project_id": 10}),
    );
    let change = TableChange::decode(&envelope).unwrap();
    let err = projector.apply(&change).await.unwrap_err();

    // The divergence names the stale side instead of vanishing into a log.
    match &err {
        ProjectorError::EdgeDiverged { table, stale, .. } => {
            assert_eq!(*table, "user_projects");
            assert_eq!(stale.len(), 1);
            assert_eq!(stale[0].collection, Collection::Projects);
            assert_eq!(stale[0].id, 10);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The healthy side applied; the failed side stayed stale.
    let user = index.fetch(Collection::Users, 1).await.unwrap().unwrap();
    assert_eq!(user[fields::PROJECT_IDS], json!([10]));
    let project = index.fetch(Collection::Projects, 10).await.unwrap().unwrap();
    assert_eq!(project[fields::USER_IDS], json!([]));

    // Replaying the same (idempotent) event after recovery repairs it.
    index.armed.store(false, Ordering::SeqCst);
    projector.apply(&change).await.unwrap();
    let project = index.fetch(Collection::Projects, 10).await.unwrap().unwrap();
    assert_eq!(project[fields::USER_IDS], json!([1]));
}
