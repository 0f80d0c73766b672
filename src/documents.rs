//! Document shapes held in the index.
//!
//! One collection per entity type; each document is addressed by the
//! entity's primary id and carries its scalar fields plus the
//! back-reference arrays used to avoid live joins at read time:
//!
//! | collection | scalars | back-references |
//! |---|---|---|
//! | `users` | id, name, created_at | `project_ids` |
//! | `hashtags` | id, name, created_at | `project_ids` |
//! | `projects` | id, name, slug, description, created_at | `hashtag_ids`, `user_ids` |
//!
//! Documents travel as JSON values with the arrays recombined; the scalar
//! projections below are what entity upserts write.

use serde_json::Value;
use std::fmt;

use crate::change::{HashtagRow, ProjectRow, UserRow};

/// Back-reference field names, shared by the projector and the read path.
pub mod fields {
    pub const PROJECT_IDS: &str = "project_ids";
    pub const HASHTAG_IDS: &str = "hashtag_ids";
    pub const USER_IDS: &str = "user_ids";
}

/// The three entity collections in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Hashtags,
    Projects,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Hashtags => "hashtags",
            Collection::Projects => "projects",
        }
    }

    /// The back-reference fields documents in this collection carry.
    pub fn ref_fields(&self) -> &'static [&'static str] {
        match self {
            Collection::Users => &[fields::PROJECT_IDS],
            Collection::Hashtags => &[fields::PROJECT_IDS],
            Collection::Projects => &[fields::HASHTAG_IDS, fields::USER_IDS],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar-only projections of the source rows, used for entity upserts.
///
/// Back-reference arrays are deliberately absent: an entity INSERT/UPDATE
/// replaces scalars and nothing else.
pub fn user_scalars(row: &UserRow) -> Value {
    serde_json::json!({
        "id": row.id,
        "name": row.name,
        "created_at": row.created_at,
    })
}

pub fn hashtag_scalars(row: &HashtagRow) -> Value {
    serde_json::json!({
        "id": row.id,
        "name": row.name,
        "created_at": row.created_at,
    })
}

pub fn project_scalars(row: &ProjectRow) -> Value {
    serde_json::json!({
        "id": row.id,
        "name": row.name,
        "slug": row.slug,
        "description": row.description,
        "created_at": row.created_at,
    })
}
