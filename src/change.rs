//! Change events flowing through the pipeline.
//!
//! Every row mutation in the relational source produces one JSON payload:
//!
//! ```json
//! {
//!   "table": "user_projects",
//!   "operation": "INSERT",
//!   "data": { "user_id": 1, "project_id": 10 }
//! }
//! ```
//!
//! [`ChangeEnvelope`] is that wire shape, kept loosely typed so the capture
//! path can forward anything the source emits. [`TableChange`] is the typed
//! view the projector works with: one variant per known table, each carrying
//! a validated payload, plus an explicit [`TableChange::Ignored`] variant for
//! tables this pipeline does not project.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Source tables the projector knows how to handle.
pub const TABLE_USERS: &str = "users";
pub const TABLE_HASHTAGS: &str = "hashtags";
pub const TABLE_PROJECTS: &str = "projects";
pub const TABLE_USER_PROJECTS: &str = "user_projects";
pub const TABLE_PROJECT_HASHTAGS: &str = "project_hashtags";

/// Row-level operation reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// The wire payload for one row mutation, exactly as the source emits it.
///
/// `data` stays untyped here; validation against the per-table row shapes
/// happens in [`TableChange::decode`], so the capture path never has to know
/// the schema of the tables it forwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub table: String,
    pub operation: Operation,
    pub data: Value,
}

impl ChangeEnvelope {
    pub fn new(table: impl Into<String>, operation: Operation, data: Value) -> Self {
        Self {
            table: table.into(),
            operation,
            data,
        }
    }

    /// Parse an envelope from a raw notification or stream payload.
    pub fn from_json(raw: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(raw).map_err(DecodeError::Envelope)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Errors produced while decoding a change payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed change envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("invalid row data for table '{table}': {source}")]
    Row {
        table: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A `users` row. DELETE events may carry only the primary id, so every
/// scalar except `id` defaults when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: String,
}

/// A `hashtags` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashtagRow {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: String,
}

/// A `projects` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: String,
}

/// One edge of the user ↔ project many-to-many relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProjectEdge {
    pub user_id: i64,
    pub project_id: i64,
}

/// One edge of the project ↔ hashtag many-to-many relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectHashtagEdge {
    pub project_id: i64,
    pub hashtag_id: i64,
}

/// A change envelope resolved against the known source tables.
///
/// Entity variants replace document scalars wholesale; association variants
/// mutate the back-reference arrays on both endpoint documents. Unknown
/// tables resolve to [`TableChange::Ignored`] rather than an error, since a
/// source may notify about tables this pipeline does not index.
#[derive(Debug, Clone)]
pub enum TableChange {
    User { op: Operation, row: UserRow },
    Hashtag { op: Operation, row: HashtagRow },
    Project { op: Operation, row: ProjectRow },
    UserProject { op: Operation, edge: UserProjectEdge },
    ProjectHashtag { op: Operation, edge: ProjectHashtagEdge },
    Ignored { table: String },
}

impl TableChange {
    /// Resolve an envelope into its typed per-table form.
    ///
    /// Row validation happens here: an envelope for a known table whose
    /// `data` does not deserialize is a [`DecodeError::Row`], while an
    /// envelope for an unknown table is `Ok(Ignored)`.
    pub fn decode(envelope: &ChangeEnvelope) -> Result<Self, DecodeError> {
        let op = envelope.operation;
        match envelope.table.as_str() {
            TABLE_USERS => Ok(TableChange::User {
                op,
                row: decode_data(envelope)?,
            }),
            TABLE_HASHTAGS => Ok(TableChange::Hashtag {
                op,
                row: decode_data(envelope)?,
            }),
            TABLE_PROJECTS => Ok(TableChange::Project {
                op,
                row: decode_data(envelope)?,
            }),
            TABLE_USER_PROJECTS => Ok(TableChange::UserProject {
                op,
                edge: decode_data(envelope)?,
            }),
            TABLE_PROJECT_HASHTAGS => Ok(TableChange::ProjectHashtag {
                op,
                edge: decode_data(envelope)?,
            }),
            other => Ok(TableChange::Ignored {
                table: other.to_string(),
            }),
        }
    }

    /// The source table this change belongs to.
    pub fn table(&self) -> &str {
        match self {
            TableChange::User { .. } => TABLE_USERS,
            TableChange::Hashtag { .. } => TABLE_HASHTAGS,
            TableChange::Project { .. } => TABLE_PROJECTS,
            TableChange::UserProject { .. } => TABLE_USER_PROJECTS,
            TableChange::ProjectHashtag { .. } => TABLE_PROJECT_HASHTAGS,
            TableChange::Ignored { table } => table,
        }
    }
}

fn decode_data<T: DeserializeOwned>(envelope: &ChangeEnvelope) -> Result<T, DecodeError> {
    serde_json::from_value(envelope.data.clone()).map_err(|source| DecodeError::Row {
        table: envelope.table.clone(),
        source,
    })
}
