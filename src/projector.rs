//! Projector — applies change events to the document index.
//!
//! This is the consistency core of the pipeline. Dispatch is keyed on
//! `(table, operation)`:
//!
//! - entity tables (`users`, `hashtags`, `projects`): INSERT/UPDATE upserts
//!   the document's scalar fields by primary id, DELETE removes the
//!   document. Back-reference arrays are never written on this path.
//! - association tables (`user_projects`, `project_hashtags`): INSERT adds
//!   each endpoint's id to the other endpoint's back-reference array,
//!   DELETE retracts them. Both sides are updated independently — they
//!   touch disjoint documents — and the event only counts as handled when
//!   both have completed.
//!
//! Every mutation is idempotent, so redelivered events are harmless: a
//! replayed association INSERT is a no-op after the first application, and
//! a replayed DELETE is safe once the id is gone.
//!
//! The two endpoint updates are not transactional with each other. Each
//! side's outcome is tracked; a failed side gets one immediate retry, and
//! anything still failing is reported as [`ProjectorError::EdgeDiverged`]
//! naming the stale side, so the caller's retry machinery can re-apply the
//! whole (idempotent) event instead of the divergence dissolving into a
//! log line.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::change::{Operation, TableChange};
use crate::documents::{
    fields, hashtag_scalars, project_scalars, user_scalars, Collection,
};
use crate::index::{DocumentIndex, IndexError};

/// Ceiling on any single document update; a hung index connection must not
/// stall the consume loop indefinitely.
const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// One endpoint of a two-sided association update.
#[derive(Debug, Clone, Copy)]
struct EdgeSide {
    collection: Collection,
    id: i64,
    field: &'static str,
    target: i64,
}

impl fmt::Display for EdgeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.collection, self.id, self.field)
    }
}

/// A side left stale after retry.
#[derive(Debug)]
pub struct StaleSide {
    pub collection: Collection,
    pub id: i64,
    pub field: &'static str,
    pub error: IndexError,
}

#[derive(Debug, Error)]
pub enum ProjectorError {
    #[error("{operation} on {collection}/{id} failed: {source}")]
    Entity {
        collection: Collection,
        id: i64,
        operation: Operation,
        #[source]
        source: IndexError,
    },

    #[error("association {table} {operation} diverged: {} side(s) stale", stale.len())]
    EdgeDiverged {
        table: &'static str,
        operation: Operation,
        stale: Vec<StaleSide>,
    },
}

/// What a successfully applied change did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Entity scalars created or replaced.
    Upserted { collection: Collection, id: i64 },
    /// Entity document removed (`existed` is false for a replayed delete).
    Removed {
        collection: Collection,
        id: i64,
        existed: bool,
    },
    /// Both sides of an association edge updated.
    EdgeApplied { table: &'static str },
    EdgeRetracted { table: &'static str },
    /// Nothing touched (unknown table, or an operation with no effect here).
    Ignored,
}

/// Applies [`TableChange`]s to an injected [`DocumentIndex`].
#[derive(Clone)]
pub struct Projector {
    index: Arc<dyn DocumentIndex>,
    update_timeout: Duration,
}

impl Projector {
    pub fn new(index: Arc<dyn DocumentIndex>) -> Self {
        Self {
            index,
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
        }
    }

    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }

    /// Bound one index mutation by the update timeout.
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, IndexError>>,
    ) -> Result<T, IndexError> {
        match tokio::time::timeout(self.update_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(IndexError::Timeout(self.update_timeout)),
        }
    }

    pub async fn apply(&self, change: &TableChange) -> Result<Projection, ProjectorError> {
        match change {
            TableChange::User { op, row } => {
                self.apply_entity(Collection::Users, row.id, *op, || user_scalars(row))
                    .await
            }
            TableChange::Hashtag { op, row } => {
                self.apply_entity(Collection::Hashtags, row.id, *op, || hashtag_scalars(row))
                    .await
            }
            TableChange::Project { op, row } => {
                self.apply_entity(Collection::Projects, row.id, *op, || project_scalars(row))
                    .await
            }
            TableChange::UserProject { op, edge } => {
                self.apply_edge(
                    crate::change::TABLE_USER_PROJECTS,
                    *op,
                    EdgeSide {
                        collection: Collection::Users,
                        id: edge.user_id,
                        field: fields::PROJECT_IDS,
                        target: edge.project_id,
                    },
                    EdgeSide {
                        collection: Collection::Projects,
                        id: edge.project_id,
                        field: fields::USER_IDS,
                        target: edge.user_id,
                    },
                )
                .await
            }
            TableChange::ProjectHashtag { op, edge } => {
                self.apply_edge(
                    crate::change::TABLE_PROJECT_HASHTAGS,
                    *op,
                    EdgeSide {
                        collection: Collection::Projects,
                        id: edge.project_id,
                        field: fields::HASHTAG_IDS,
                        target: edge.hashtag_id,
                    },
                    EdgeSide {
                        collection: Collection::Hashtags,
                        id: edge.hashtag_id,
                        field: fields::PROJECT_IDS,
                        target: edge.project_id,
                    },
                )
                .await
            }
            TableChange::Ignored { table } => {
                debug!(table = %table, "no projection for table, ignoring");
                Ok(Projection::Ignored)
            }
        }
    }

    async fn apply_entity<F>(
        &self,
        collection: Collection,
        id: i64,
        op: Operation,
        scalars: F,
    ) -> Result<Projection, ProjectorError>
    where
        F: FnOnce() -> serde_json::Value,
    {
        match op {
            Operation::Insert | Operation::Update => {
                self.bounded(self.index.put_scalars(collection, id, scalars()))
                    .await
                    .map_err(|source| ProjectorError::Entity {
                        collection,
                        id,
                        operation: op,
                        source,
                    })?;
                debug!(collection = %collection, id = id, op = %op, "entity scalars upserted");
                Ok(Projection::Upserted { collection, id })
            }
            Operation::Delete => {
                let existed = self
                    .bounded(self.index.remove(collection, id))
                    .await
                    .map_err(|source| ProjectorError::Entity {
                        collection,
                        id,
                        operation: op,
                        source,
                    })?;
                debug!(collection = %collection, id = id, existed = existed, "entity removed");
                Ok(Projection::Removed {
                    collection,
                    id,
                    existed,
                })
            }
        }
    }

    async fn apply_edge(
        &self,
        table: &'static str,
        op: Operation,
        left: EdgeSide,
        right: EdgeSide,
    ) -> Result<Projection, ProjectorError> {
        if op == Operation::Update {
            // Association rows are only ever inserted or deleted upstream.
            warn!(table = %table, "UPDATE on association table has no projection, ignoring");
            return Ok(Projection::Ignored);
        }

        let (left_result, right_result) = tokio::join!(
            self.mutate_side(op, left),
            self.mutate_side(op, right),
        );

        let mut stale = Vec::new();
        for (side, result) in [(left, left_result), (right, right_result)] {
            let Err(first) = result else { continue };
            warn!(
                table = %table,
                side = %side,
                error = %first,
                "endpoint update failed, retrying once"
            );
            if let Err(again) = self.mutate_side(op, side).await {
                stale.push(StaleSide {
                    collection: side.collection,
                    id: side.id,
                    field: side.field,
                    error: again,
                });
            }
        }

        if !stale.is_empty() {
            for side in &stale {
                warn!(
                    table = %table,
                    collection = %side.collection,
                    id = side.id,
                    field = side.field,
                    error = %side.error,
                    "association side left stale"
                );
            }
            return Err(ProjectorError::EdgeDiverged {
                table,
                operation: op,
                stale,
            });
        }

        debug!(table = %table, op = %op, "association edge projected on both sides");
        Ok(match op {
            Operation::Insert => Projection::EdgeApplied { table },
            _ => Projection::EdgeRetracted { table },
        })
    }

    async fn mutate_side(&self, op: Operation, side: EdgeSide) -> Result<bool, IndexError> {
        match op {
            Operation::Insert => {
                self.bounded(
                    self.index
                        .add_ref(side.collection, side.id, side.field, side.target),
                )
                .await
            }
            _ => {
                self.bounded(
                    self.index
                        .remove_ref(side.collection, side.id, side.field, side.target),
                )
                .await
            }
        }
    }
}
